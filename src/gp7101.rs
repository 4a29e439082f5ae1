//! GP7101 I2C backlight controller.
//!
//! The chip takes an 8-bit PWM duty cycle in register `0x03`. Probing
//! resolves the brightness limits from the device node, registers a raw
//! backlight device and pushes the initial level to hardware.

use std::{
    marker::PhantomData,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    backlight::{
        BacklightClass, BacklightDevice, BacklightError, BacklightOps, BacklightProperties,
        BacklightType,
    },
    i2c::{I2cClient, I2cTransport, REG_CTRL_8, RegAddr, TransferError},
    of::{self, DeviceId, DeviceNode},
};

pub const DRIVER_NAME: &str = "gp7101-backlight";
pub const OF_MATCH_TABLE: &[DeviceId] = &[DeviceId::new(DRIVER_NAME)];

pub const MAX_BRIGHTNESS: u32 = 255;
pub const PROP_MAX_BRIGHTNESS: &str = "max-brightness-levels";
pub const PROP_DEFAULT_BRIGHTNESS: &str = "default-brightness-level";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no driver matches compatible {0:?}")]
    NoMatch(String),
    #[error("failed to register backlight device: {0}")]
    Register(#[from] BacklightError),
}

/// A device on the bus waiting to be bound.
#[derive(Debug)]
pub struct I2cDevice<T> {
    pub client: I2cClient<T>,
    pub node: DeviceNode,
    pub class: BacklightClass,
    /// Name the backlight is registered under.
    pub name: String,
}

/// Per-device state handed to the backlight class.
#[derive(Debug)]
pub struct DeviceContext<T> {
    client: OnceLock<Mutex<I2cClient<T>>>,
}

impl<T> DeviceContext<T> {
    fn new() -> Self {
        Self {
            client: OnceLock::new(),
        }
    }
}

pub struct Gp7101Ops<T>(PhantomData<fn() -> T>);

impl<T> BacklightOps for Gp7101Ops<T>
where
    T: I2cTransport + Send + 'static,
{
    type Data = DeviceContext<T>;

    /// Write failures are logged by the I2C layer and otherwise ignored, so
    /// the next brightness change is still attempted.
    fn update_status(bl: &BacklightDevice<Self>) -> Result<(), BacklightError> {
        let brightness = bl.brightness();
        debug!("pwm:{brightness}");

        let Some(client) = bl.data().client.get() else {
            warn!("{}: update before client was attached", bl.name());
            return Ok(());
        };
        let level = u8::try_from(brightness).unwrap_or(u8::MAX);
        let _ = client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(RegAddr::OneByte(REG_CTRL_8), &[level]);
        Ok(())
    }
}

pub type Gp7101Backlight<T> = BacklightDevice<Gp7101Ops<T>>;

/// A bound GP7101. Dropping it releases the backlight registration and the
/// device context.
#[derive(Debug)]
pub struct Gp7101<T>
where
    T: I2cTransport + Send + 'static,
{
    backlight: Arc<Gp7101Backlight<T>>,
}

impl<T> Gp7101<T>
where
    T: I2cTransport + Send + 'static,
{
    pub fn backlight(&self) -> &Arc<Gp7101Backlight<T>> {
        &self.backlight
    }

    pub fn remove(self) {
        debug!("{}: remove", self.backlight.name());
    }
}

/// Applies the device node overrides to the default properties, clamping
/// them so that `brightness <= max_brightness <= 255`.
pub fn resolve_properties(node: &DeviceNode) -> BacklightProperties {
    let mut max_brightness = node.read_u32(PROP_MAX_BRIGHTNESS).unwrap_or(MAX_BRIGHTNESS);
    if max_brightness > MAX_BRIGHTNESS {
        max_brightness = MAX_BRIGHTNESS;
    }
    let mut brightness = node.read_u32(PROP_DEFAULT_BRIGHTNESS).unwrap_or(max_brightness);
    if brightness > max_brightness {
        brightness = max_brightness;
    }

    BacklightProperties {
        kind: BacklightType::Raw,
        max_brightness,
        brightness,
    }
}

/// Matches `dev` against [`OF_MATCH_TABLE`] and probes it.
pub fn bind<T>(dev: I2cDevice<T>) -> Result<Gp7101<T>, ProbeError>
where
    T: I2cTransport + Send + 'static,
{
    let id = *of::match_device(OF_MATCH_TABLE, &dev.node)
        .ok_or_else(|| ProbeError::NoMatch(dev.node.compatible.clone()))?;
    probe(dev, &id)
}

pub fn probe<T>(dev: I2cDevice<T>, id: &DeviceId) -> Result<Gp7101<T>, ProbeError>
where
    T: I2cTransport + Send + 'static,
{
    debug!("probe {} at 0x{:02x}", id.compatible, dev.client.addr());

    let props = resolve_properties(&dev.node);
    let backlight = dev
        .class
        .register::<Gp7101Ops<T>>(&dev.name, DeviceContext::new(), props)?;

    // The context is fresh, so the cell is always empty here.
    let _ = backlight.data().client.set(Mutex::new(dev.client));

    info!(
        "{}: max_brightness:{} brightness:{}",
        backlight.name(),
        props.max_brightness,
        props.brightness
    );
    backlight.update_status()?;

    Ok(Gp7101 { backlight })
}

/// Reads the duty cycle currently latched in the control register.
pub fn read_brightness<T: I2cTransport>(client: &mut I2cClient<T>) -> Result<u8, TransferError> {
    let mut buf = [0u8; 1];
    client.read(RegAddr::OneByte(REG_CTRL_8), &mut buf)?;
    Ok(buf[0])
}

/// Replaces the node's default level with the one latched in hardware, so
/// that probing keeps the panel where it is.
pub fn seed_from_hardware<T: I2cTransport>(dev: &mut I2cDevice<T>) -> Result<u8, TransferError> {
    let level = read_brightness(&mut dev.client)?;
    dev.node = std::mem::take(&mut dev.node).with_property(PROP_DEFAULT_BRIGHTNESS, level);
    Ok(level)
}
