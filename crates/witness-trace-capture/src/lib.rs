use std::error::Error;
use std::ffi::c_void;
use std::fmt;
use std::fmt::Write as _;
use std::num::NonZeroUsize;
use witness_types::{InvariantError, StackCapture, StackHandle};

const DEFAULT_MAX_FRAMES: NonZeroUsize = NonZeroUsize::new(64).unwrap();

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub max_frames: NonZeroUsize,
    pub skip_frames: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            skip_frames: 0,
        }
    }
}

#[derive(Debug)]
pub enum CaptureError {
    EmptyBacktrace,
    InvariantViolation {
        context: &'static str,
        source: InvariantError,
    },
}

impl CaptureError {
    fn invariant(context: &'static str, source: InvariantError) -> Self {
        Self::InvariantViolation { context, source }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBacktrace => write!(f, "invariant violated: captured backtrace must be non-empty"),
            Self::InvariantViolation { context, source } => {
                write!(f, "invariant violated in {context}: {source}")
            }
        }
    }
}

impl Error for CaptureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvariantViolation { source, .. } => Some(source),
            Self::EmptyBacktrace => None,
        }
    }
}

/// Walk the current thread's stack and record raw instruction pointers,
/// innermost first.
pub fn capture_current(options: CaptureOptions) -> Result<StackHandle, CaptureError> {
    let mut raw_ips = Vec::new();
    let mut skip_remaining = options.skip_frames;

    backtrace::trace(|frame| {
        if skip_remaining > 0 {
            skip_remaining -= 1;
            return true;
        }

        if raw_ips.len() >= options.max_frames.get() {
            return false;
        }

        raw_ips.push(frame.ip() as usize as u64);
        true
    });

    if raw_ips.is_empty() {
        return Err(CaptureError::EmptyBacktrace);
    }

    StackHandle::new(raw_ips).map_err(|err| CaptureError::invariant("stack_handle", err))
}

/// Symbolise a captured stack, one `#depth 0xip name at file:line` line per
/// frame. Frames that do not resolve keep only their address.
pub fn render(stack: &StackHandle) -> String {
    let mut out = String::new();
    for (depth, ip) in stack.frames().iter().copied().enumerate() {
        let mut resolved = false;
        backtrace::resolve(ip as usize as *mut c_void, |symbol| {
            if resolved {
                return;
            }
            resolved = true;
            let _ = write!(out, "#{depth} 0x{ip:x}");
            match symbol.name() {
                Some(name) => {
                    let _ = write!(out, " {name:#}");
                }
                None => out.push_str(" <unknown>"),
            }
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                let _ = write!(out, " at {}:{line}", file.display());
            }
            out.push('\n');
        });
        if !resolved {
            let _ = writeln!(out, "#{depth} 0x{ip:x}");
        }
    }
    out
}

/// `StackCapture` backed by the `backtrace` crate.
#[derive(Debug, Clone, Copy)]
pub struct BacktraceCapture {
    options: CaptureOptions,
}

impl BacktraceCapture {
    pub fn new(options: CaptureOptions) -> Self {
        Self { options }
    }
}

impl Default for BacktraceCapture {
    fn default() -> Self {
        // Skip the trace walker and the checker frames that call into us.
        Self::new(CaptureOptions {
            skip_frames: 2,
            ..CaptureOptions::default()
        })
    }
}

impl StackCapture for BacktraceCapture {
    fn capture(&self) -> Option<StackHandle> {
        capture_current(self.options).ok()
    }

    fn render(&self, stack: &StackHandle) -> String {
        render(stack)
    }
}
