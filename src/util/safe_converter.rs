/// For widening casts that can never lose information on the supported platforms.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u128> for u64 {
    fn safe_cast(self) -> u128 {
        self as u128
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for i16 {
    /// NB: negative values are mapped to zero - this is the 'payload length' view of a signed
    ///  length field
    fn safe_cast(self) -> usize {
        self.max(0) as usize
    }
}

/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<i16> for usize {
    fn prechecked_cast(self) -> i16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<i32> for usize {
    fn prechecked_cast(self) -> i32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
