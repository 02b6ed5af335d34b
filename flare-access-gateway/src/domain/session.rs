use std::fmt;

use super::error::GatewayError;

/// 会话状态
///
/// `Connecting → Authenticated → Active → Closing → Closed`，
/// `Rejected` 只能由 `Connecting` 进入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// 收到升级请求，尚未校验
    #[default]
    Connecting,
    /// 令牌校验通过，等待升级
    Authenticated,
    /// 已升级并登记，读循环运行中
    Active,
    Closing,
    Closed,
    /// 头部缺失或令牌无效，未升级
    Rejected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Rejected)
                | (Authenticated, Active)
                | (Authenticated, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    /// 状态迁移，非法迁移返回错误且保持原状态
    pub fn transition(&mut self, next: SessionState) -> Result<(), GatewayError> {
        if !self.can_transition_to(next) {
            return Err(GatewayError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut state = SessionState::default();
        for next in [
            SessionState::Authenticated,
            SessionState::Active,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn rejected_only_from_connecting() {
        let mut state = SessionState::Connecting;
        state.transition(SessionState::Rejected).unwrap();
        assert!(state.is_terminal());

        let mut active = SessionState::Active;
        let err = active.transition(SessionState::Rejected).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InvalidTransition {
                from: SessionState::Active,
                to: SessionState::Rejected
            }
        ));
        assert_eq!(active, SessionState::Active);
    }

    #[test]
    fn closed_is_final() {
        let mut state = SessionState::Closed;
        assert!(state.transition(SessionState::Active).is_err());
        assert!(state.transition(SessionState::Closing).is_err());
    }
}
