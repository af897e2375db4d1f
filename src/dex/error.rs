use std::fmt;

/// Build a `DexError`, optionally wrapped in a formatted context.
#[macro_export]
macro_rules! dex_err {
    ($msg:literal) => {
        $crate::dex::error::DexError::new(format!($msg))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::dex::error::DexError::new(format!($fmtstr, $($args)*))
    };
}

/// Return early with a `DexError`.
#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::dex::error::DexError::new(format!($msg)))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::dex::error::DexError::new(format!($fmtstr, $($args)*)))
    };
}

/// Error raised while decoding or encoding a DEX container.
///
/// Contexts are pushed innermost first, so a failure while reading a code item renders as
/// `bad opcode 0xff for code of Lcom/example/Foo;->run()V of class_def 12`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexError {
    msg: String,
    contexts: Vec<String>,
}

impl DexError {
    pub fn new(msg: impl Into<String>) -> Self {
        DexError {
            msg: msg.into(),
            contexts: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.contexts.push(context.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for DexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for DexError {}

/// Attach a lazily formatted context to the error side of a `Result`.
pub trait DexResultExt<T> {
    fn context<F, S>(self, f: F) -> Result<T, DexError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> DexResultExt<T> for Result<T, DexError> {
    fn context<F, S>(self, f: F) -> Result<T, DexError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
