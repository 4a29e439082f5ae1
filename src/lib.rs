pub mod backlight;
pub mod config;
pub mod gp7101;
pub mod i2c;
#[cfg(feature = "i2cdev")]
pub mod linux;
pub mod of;

#[cfg(feature = "i2cdev")]
pub use linux::LinuxBus;

use anyhow::Result;

use backlight::{BacklightDevice, BacklightOps};

pub trait BrightnessManager {
    type Error: AsRef<dyn std::error::Error>;
    fn get_brightness(&self) -> Result<u32, Self::Error>;
    fn max_brightness(&self) -> u32;
    fn set_brightness(&self, value: u32) -> Result<u32, Self::Error>;
    fn adjust_brightness(&self, step: i32) -> Result<u32, Self::Error>;
}

impl<O: BacklightOps> BrightnessManager for BacklightDevice<O> {
    type Error = anyhow::Error;

    fn get_brightness(&self) -> Result<u32> {
        Ok(self.brightness())
    }

    fn max_brightness(&self) -> u32 {
        BacklightDevice::max_brightness(self)
    }

    fn set_brightness(&self, value: u32) -> Result<u32> {
        let clamped_value = std::cmp::min(BacklightDevice::max_brightness(self), value);
        BacklightDevice::set_brightness(self, clamped_value)?;
        Ok(clamped_value)
    }

    fn adjust_brightness(&self, step: i32) -> Result<u32> {
        let new_value = self.modify_brightness(|props| {
            let current = props.brightness;
            let new_value = if step < 0 {
                current.saturating_sub(step.unsigned_abs())
            } else {
                current.saturating_add(step as u32)
            };
            std::cmp::min(props.max_brightness, new_value)
        })?;
        Ok(new_value)
    }
}
