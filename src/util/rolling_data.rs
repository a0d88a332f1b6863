/// A rolling window over the most recent `N` values, keeping a cached sum so that the mean is
///  available in constant time.
///
/// The window starts with a single initial value that is evicted like any other value once `N`
///  newer values were added.
#[derive(Debug, Clone)]
pub struct RollingData<const N: usize> {
    buf: BufferImpl<N>,
    cached_sum: f64,
}
impl<const N: usize> RollingData<N> {
    pub fn new(initial_value: f64) -> Self {
        assert!(N > 0, "rolling window must hold at least one value");

        let mut buf = BufferImpl::new();
        assert!(buf.add_value(initial_value).is_none());

        RollingData {
            buf,
            cached_sum: initial_value,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
        }
        self.cached_sum += value;
    }

    pub fn mean(&self) -> f64 {
        self.cached_sum / self.buf.len() as f64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}


#[derive(Debug, Clone)]
enum BufferImpl<const N: usize> {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl <const N: usize> BufferImpl<N> {
    fn new() -> BufferImpl<N> {
        BufferImpl::Growing(Vec::with_capacity(N))
    }

    fn len(&self) -> usize {
        match self {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
