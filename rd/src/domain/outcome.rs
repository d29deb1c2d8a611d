//! Robot exit classification

/// Exit code recorded when a stop leaves no observable exit status
pub const STOPPED_MANUALLY: i32 = -1;

/// SIGTERM, encoded as a negative signal number
const TERMINATED_BY_SIGNAL: i32 = -15;

/// SIGTERM forwarded through a shell (`128 + 15`)
const TERMINATED_VIA_SHELL: i32 = 143;

/// How a robot process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    StoppedGracefully,
    Failed(i32),
}

impl ExitOutcome {
    /// Classify an exit code (signals are negative signal numbers)
    pub fn classify(code: i32) -> Self {
        match code {
            0 => Self::Success,
            TERMINATED_BY_SIGNAL | TERMINATED_VIA_SHELL => Self::StoppedGracefully,
            other => Self::Failed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ExitOutcome::classify(0), ExitOutcome::Success);
        assert_eq!(ExitOutcome::classify(-15), ExitOutcome::StoppedGracefully);
        assert_eq!(ExitOutcome::classify(143), ExitOutcome::StoppedGracefully);
        assert_eq!(ExitOutcome::classify(1), ExitOutcome::Failed(1));
        assert_eq!(ExitOutcome::classify(-9), ExitOutcome::Failed(-9));
    }
}
