use std::fmt;

pub struct FormattedSize {
    pub size: u64,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: u64) -> FormattedSize {
    FormattedSize { size }
}

/// Reports an unrecoverable runtime contract violation and aborts the process.
///
/// Used where continuing would leave the heap in an inconsistent state, so unwinding is
/// not an option either.
#[cold]
#[inline(never)]
pub fn fatal(message: fmt::Arguments<'_>) -> ! {
    eprintln!("cmsgc: fatal error: {}", message);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort()
}
