use serde::{Deserialize, Serialize};

/// Outcome of a dispatched stage, mapped to the process exit code by the binary.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Status {
    pub ok: bool,
    pub code: Option<i32>,
    pub reason: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            ok: true,
            code: Some(0),
            reason: None,
        }
    }

    pub fn success() -> Self {
        Self::ok()
    }

    pub fn err(code: i32, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: Some(code),
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.ok
    }

    /// Process exit code; failures without an explicit code exit with 1.
    pub fn exit_code(&self) -> i32 {
        if self.ok {
            0
        } else {
            match self.code {
                Some(0) | None => 1,
                Some(code) => code,
            }
        }
    }
}
