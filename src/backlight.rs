//! Minimal backlight class: registered devices, their brightness properties
//! and the driver callback invoked whenever brightness changes.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::debug;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BacklightType {
    /// Brightness is written straight to hardware registers.
    #[default]
    Raw,
}

impl fmt::Display for BacklightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BacklightType::Raw => "raw",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BacklightProperties {
    pub kind: BacklightType,
    pub max_brightness: u32,
    pub brightness: u32,
}

#[derive(Debug, Error)]
pub enum BacklightError {
    #[error("backlight device {0:?} already registered")]
    Exists(String),
    #[error("invalid backlight name {0:?}")]
    InvalidName(String),
    #[error("brightness {level} exceeds maximum {max}")]
    InvalidLevel { level: u32, max: u32 },
}

/// Driver side of a backlight device.
pub trait BacklightOps: Sized + 'static {
    type Data: Send + Sync;

    /// Pushes the device's current properties to hardware.
    fn update_status(bl: &BacklightDevice<Self>) -> Result<(), BacklightError>;
}

/// Registry of backlight device names.
#[derive(Debug, Clone, Default)]
pub struct BacklightClass {
    names: Arc<Mutex<HashSet<String>>>,
}

impl BacklightClass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device under `name`. The name is released again when the
    /// last reference to the returned device is dropped.
    pub fn register<O: BacklightOps>(
        &self,
        name: &str,
        data: O::Data,
        props: BacklightProperties,
    ) -> Result<Arc<BacklightDevice<O>>, BacklightError> {
        if name.is_empty() || name.contains('/') {
            return Err(BacklightError::InvalidName(name.to_string()));
        }
        if !self.lock().insert(name.to_string()) {
            return Err(BacklightError::Exists(name.to_string()));
        }
        debug!("registered backlight {name} ({} max {})", props.kind, props.max_brightness);

        Ok(Arc::new(BacklightDevice {
            name: name.to_string(),
            class: self.clone(),
            props: Mutex::new(props),
            update_lock: Mutex::new(()),
            data,
        }))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct BacklightDevice<O: BacklightOps> {
    name: String,
    class: BacklightClass,
    props: Mutex<BacklightProperties>,
    update_lock: Mutex<()>,
    data: O::Data,
}

impl<O: BacklightOps> BacklightDevice<O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver data bound at registration.
    pub fn data(&self) -> &O::Data {
        &self.data
    }

    pub fn props(&self) -> BacklightProperties {
        *self.props_lock()
    }

    pub fn brightness(&self) -> u32 {
        self.props_lock().brightness
    }

    pub fn max_brightness(&self) -> u32 {
        self.props_lock().max_brightness
    }

    /// Stores a new requested level and hands it to the driver.
    pub fn set_brightness(&self, level: u32) -> Result<(), BacklightError> {
        self.modify_brightness(|_| level).map(|_| ())
    }

    /// Computes the new level from the current properties, stores it and
    /// hands it to the driver. No other update can run in between.
    pub fn modify_brightness<F>(&self, f: F) -> Result<u32, BacklightError>
    where
        F: FnOnce(&BacklightProperties) -> u32,
    {
        let _guard = self.update_guard();
        let level = {
            let mut props = self.props_lock();
            let level = f(&props);
            if level > props.max_brightness {
                return Err(BacklightError::InvalidLevel {
                    level,
                    max: props.max_brightness,
                });
            }
            props.brightness = level;
            level
        };
        O::update_status(self)?;
        Ok(level)
    }

    /// Calls the driver's update hook. Calls are serialized per device.
    pub fn update_status(&self) -> Result<(), BacklightError> {
        let _guard = self.update_guard();
        O::update_status(self)
    }

    fn update_guard(&self) -> MutexGuard<'_, ()> {
        self.update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn props_lock(&self) -> MutexGuard<'_, BacklightProperties> {
        self.props.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<O: BacklightOps> fmt::Debug for BacklightDevice<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BacklightDevice")
            .field("name", &self.name)
            .field("props", &self.props())
            .finish_non_exhaustive()
    }
}

impl<O: BacklightOps> Drop for BacklightDevice<O> {
    fn drop(&mut self) {
        self.class.lock().remove(&self.name);
        debug!("unregistered backlight {}", self.name);
    }
}
