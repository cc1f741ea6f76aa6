use std::fmt;

pub type LD<T> = Result<T, LDException>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LDCode {
    E4001,   // Malformed dependence report
    E4002,   // Pointer without partition
    E4003,   // Verification failure after transform
    ICE9001, // Internal Compiler Error
}

impl LDCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E4001 => "E4001",
            Self::E4002 => "E4002",
            Self::E4003 => "E4003",
            Self::ICE9001 => "ICE9001",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "E4001" => Some(Self::E4001),
            "E4002" => Some(Self::E4002),
            "E4003" => Some(Self::E4003),
            "ICE9001" => Some(Self::ICE9001),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Seed,
    Partition,
    Version,
    Clone,
    Verify,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Seed => "Seed",
            Stage::Partition => "Partition",
            Stage::Version => "Version",
            Stage::Clone => "Clone",
            Stage::Verify => "Verify",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
}

/// A fatal condition raised while distributing a loop.
///
/// These are never retried: they mean the input analyses or the transform
/// itself are broken, and the enclosing function must not be emitted.
#[derive(Debug, Clone)]
pub struct LDException {
    pub module: &'static str,
    pub message: String,
    pub code: LDCode,
    pub stage: Stage,
    pub stacktrace: Vec<Frame>,
    pub notes: Vec<String>,
}

impl LDException {
    pub fn new(module: &'static str, code: LDCode, stage: Stage, msg: impl Into<String>) -> Self {
        Self {
            module,
            message: msg.into(),
            code,
            stage,
            stacktrace: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn push_frame(mut self, name: impl Into<String>) -> Self {
        self.stacktrace.push(Frame { name: name.into() });
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.code, LDCode::ICE9001)
    }
}

impl fmt::Display for LDException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "** ({}) {}", self.module, self.message)?;
        write!(
            f,
            "    error[{}]: {} ({})",
            self.code.as_str(),
            self.message,
            self.stage.name()
        )?;
        if !self.stacktrace.is_empty() {
            write!(f, "\n    stacktrace:")?;
            for frame in self.stacktrace.iter().rev() {
                write!(f, "\n      (ldist) {}", frame.name)?;
            }
        }
        for n in &self.notes {
            write!(f, "\nhint: {}", n)?;
        }
        Ok(())
    }
}

impl std::error::Error for LDException {}

#[macro_export]
macro_rules! bail {
    ($mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        return Err($crate::error::LDException::new($mod, $code, $stage, format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::LDException::new($mod, $code, $stage, format!($($arg)*)))
        }
    };
}

pub trait LDCtx<T> {
    fn ctx(self, name: &'static str) -> LD<T>;
}

impl<T> LDCtx<T> for LD<T> {
    fn ctx(self, name: &'static str) -> LD<T> {
        self.map_err(|e| e.push_frame(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> LD<()> {
        bail!(
            "LoopDistribute",
            LDCode::E4001,
            Stage::Seed,
            "negative count at access {}",
            3
        );
    }

    #[test]
    fn bail_carries_code_and_frames() {
        let err = failing().ctx("seed").ctx("process_loop").unwrap_err();
        assert_eq!(err.code, LDCode::E4001);
        assert_eq!(err.stage, Stage::Seed);
        let rendered = err.to_string();
        assert!(rendered.contains("error[E4001]"));
        let outer = rendered.find("(ldist) process_loop").unwrap();
        let inner = rendered.find("(ldist) seed").unwrap();
        assert!(outer < inner, "outermost frame is printed first");
    }

    #[test]
    fn codes_round_trip_through_strings() {
        for code in [LDCode::E4001, LDCode::E4002, LDCode::E4003, LDCode::ICE9001] {
            assert_eq!(LDCode::from_str(code.as_str()), Some(code));
        }
        assert_eq!(LDCode::from_str("E0000"), None);
    }
}
