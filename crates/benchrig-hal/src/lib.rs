//! `benchrig-hal` – drivers and the hardware facade for the bench rig.
//!
//! | Module             | Contents                                              |
//! |--------------------|-------------------------------------------------------|
//! | [`relay`]          | `Relay` trait for one relay-enable line               |
//! | [`channel_switch`] | channel → 4-line pattern lookup and activation        |
//! | [`generator`]      | `PulseGenerator` trait and the SCPI text driver       |
//! | [`serial`]         | serial port discovery and links                       |
//! | [`potentiometer`]  | `WiperPot` trait and code/voltage transfer functions  |
//! | [`probe`]          | `TemperatureProbe` trait                              |
//! | [`facade`]         | `HardwareFacade`, serialised access to all of the above |
//! | [`sim`]            | recording simulated drivers                           |

pub mod channel_switch;
pub mod facade;
pub mod generator;
pub mod potentiometer;
pub mod probe;
pub mod relay;
pub mod serial;
pub mod sim;

pub use channel_switch::{ChannelSwitch, RelayPattern};
pub use facade::{HardwareFacade, RigDevices};
pub use generator::{GeneratorConnector, PulseGenerator, ScpiGenerator, TriggerSource};
pub use potentiometer::{PotRails, WiperPot};
pub use probe::TemperatureProbe;
pub use relay::Relay;
