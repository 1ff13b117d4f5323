//! Generic `Relay` trait for one discrete relay-enable control line.

use benchrig_types::RigError;

/// A single on/off control line in the channel relay bank.
///
/// Drivers implement this trait and are handed to a
/// [`ChannelSwitch`][crate::channel_switch::ChannelSwitch] in line order.
pub trait Relay: Send {
    /// Stable identifier for this line, e.g. `"line0"`.
    fn id(&self) -> &str;

    /// Drive the line to `active` (`true` = energised).
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Device`] if the pin cannot be written.
    fn set_state(&mut self, active: bool) -> Result<(), RigError>;

    /// Return the line's last written state.
    fn state(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockRelay {
        id: String,
        state: bool,
    }

    impl Relay for MockRelay {
        fn id(&self) -> &str {
            &self.id
        }

        fn set_state(&mut self, active: bool) -> Result<(), RigError> {
            self.state = active;
            Ok(())
        }

        fn state(&self) -> bool {
            self.state
        }
    }

    #[test]
    fn mock_relay_toggle() {
        let mut relay = MockRelay {
            id: "line0".into(),
            state: false,
        };
        assert_eq!(relay.id(), "line0");
        relay.set_state(true).unwrap();
        assert!(relay.state());
        relay.set_state(false).unwrap();
        assert!(!relay.state());
    }
}
