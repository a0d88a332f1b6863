pub mod rolling_data;
pub mod safe_converter;
pub mod unbounded_counter;
