//! "Drive until" primitive.
//!
//! The session never blocks anywhere except here: pump the compositor's
//! event queue until a completion predicate holds. The loop sits behind
//! [`Drive`] so a timeout-bounded or cooperative variant can replace
//! [`BlockingDrive`] without touching the state machine.

use crate::error::CaptureResult;

/// Something with an event queue that can be dispatched.
pub trait EventPump {
    /// Block until at least one event is read and dispatched.
    fn dispatch_blocking(&mut self) -> CaptureResult<usize>;
}

/// Strategy for waiting on the compositor.
pub trait Drive {
    /// Pump `pump` until `done` returns true. Returns the number of dispatch
    /// iterations performed.
    fn drive_until<P, F>(&mut self, pump: &mut P, done: F) -> CaptureResult<usize>
    where
        P: EventPump + ?Sized,
        F: FnMut(&P) -> bool;
}

/// Level-triggered blocking wait with no timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingDrive;

impl Drive for BlockingDrive {
    fn drive_until<P, F>(&mut self, pump: &mut P, mut done: F) -> CaptureResult<usize>
    where
        P: EventPump + ?Sized,
        F: FnMut(&P) -> bool,
    {
        let mut iterations = 0;
        while !done(pump) {
            pump.dispatch_blocking()?;
            iterations += 1;
        }
        Ok(iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;

    struct Counter {
        dispatched: usize,
        fail_at: Option<usize>,
    }

    impl EventPump for Counter {
        fn dispatch_blocking(&mut self) -> CaptureResult<usize> {
            if self.fail_at == Some(self.dispatched) {
                return Err(CaptureError::Dispatch("Broken pipe".to_string()));
            }
            self.dispatched += 1;
            Ok(1)
        }
    }

    #[test]
    fn test_already_done_does_not_dispatch() {
        let mut pump = Counter {
            dispatched: 0,
            fail_at: None,
        };
        let n = BlockingDrive.drive_until(&mut pump, |_| true).unwrap();
        assert_eq!(n, 0);
        assert_eq!(pump.dispatched, 0);
    }

    #[test]
    fn test_dispatches_until_predicate() {
        let mut pump = Counter {
            dispatched: 0,
            fail_at: None,
        };
        let n = BlockingDrive
            .drive_until(&mut pump, |p| p.dispatched >= 5)
            .unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn test_dispatch_error_propagates() {
        let mut pump = Counter {
            dispatched: 0,
            fail_at: Some(2),
        };
        let result = BlockingDrive.drive_until(&mut pump, |_| false);
        assert!(matches!(result, Err(CaptureError::Dispatch(_))));
        assert_eq!(pump.dispatched, 2);
    }
}
