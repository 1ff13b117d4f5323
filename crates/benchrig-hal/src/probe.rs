//! Temperature probe driver trait.

use benchrig_types::RigError;

/// A resistance-thermometer front end reporting absolute temperature.
pub trait TemperatureProbe: Send {
    fn id(&self) -> &str;

    /// Take one reading, in kelvin.
    ///
    /// # Errors
    ///
    /// [`RigError::Device`] on a bus fault or an open/shorted sensor.
    fn read_kelvin(&mut self) -> Result<f64, RigError>;
}
