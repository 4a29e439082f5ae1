use std::path::Path;

use i2cdev::{
    core::{I2CMessage, I2CTransfer},
    linux::{LinuxI2CBus, LinuxI2CError, LinuxI2CMessage},
};

use crate::i2c::{I2cTransport, Message};

/// `/dev/i2c-N` adapter, driven with combined `I2C_RDWR` transfers.
pub struct LinuxBus {
    bus: LinuxI2CBus,
}

impl LinuxBus {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinuxI2CError> {
        Ok(Self {
            bus: LinuxI2CBus::new(path)?,
        })
    }
}

impl I2cTransport for LinuxBus {
    type Error = LinuxI2CError;

    fn transfer(&mut self, addr: u16, msgs: &mut [Message<'_>]) -> Result<usize, Self::Error> {
        let mut linux_msgs: Vec<LinuxI2CMessage<'_>> = msgs
            .iter_mut()
            .map(|msg| match msg {
                Message::Write(data) => LinuxI2CMessage::write(*data),
                Message::Read(buf) => LinuxI2CMessage::read(&mut **buf),
            })
            .map(|msg| msg.with_address(addr))
            .collect();
        let completed = self.bus.transfer(&mut linux_msgs)?;
        Ok(completed as usize)
    }
}
