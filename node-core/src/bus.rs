//! Bus driver abstraction and the half-duplex RS-485 implementation.

use embedded_hal::digital::OutputPin;

/// Error type for bus operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// The UART rejected the write.
    Io,
    /// The transmitter never reported idle within the spin budget.
    FlushTimeout,
    /// The drive-enable line could not be switched.
    DriveEnable,
}

impl core::fmt::Display for BusError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io => write!(f, "serial write failed"),
            Self::FlushTimeout => write!(f, "transmitter did not go idle"),
            Self::DriveEnable => write!(f, "drive-enable pin failed"),
        }
    }
}

/// Line-level access used by the dispatcher.
///
/// Every method returns promptly; the only wait allowed is the bounded
/// flush at the end of [`Bus::transmit`].
pub trait Bus {
    /// Next received byte, if one is waiting.
    fn read_byte(&mut self) -> Option<u8>;

    /// Send a complete frame and return the line to receive mode.
    fn transmit(&mut self, frame: &[u8]) -> Result<(), BusError>;

    /// Whether the receiver lost bytes since the last call.
    fn take_overrun(&mut self) -> bool {
        false
    }

    fn set_baud_rate(&mut self, baud_rate: u32);
}

/// Raw UART as seen by [`Rs485`].
pub trait SerialPort {
    type Error: core::fmt::Debug;

    fn try_read(&mut self) -> Option<u8>;

    /// Queue bytes for transmission. May return before they are on the wire.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// `true` until the last stop bit has left the shift register.
    fn is_transmitting(&mut self) -> bool;

    fn take_overrun(&mut self) -> bool {
        false
    }

    fn set_baud_rate(&mut self, baud_rate: u32);
}

/// Spin budget while waiting for the transmitter to drain. Generous for
/// 69 bytes at 9600 baud on a slow core.
pub const DEFAULT_FLUSH_SPINS: u32 = 2_000_000;

/// Half-duplex transceiver: a UART plus a drive-enable (DE/RE) pin.
pub struct Rs485<P, D> {
    port: P,
    drive_enable: D,
    flush_spins: u32,
}

impl<P: SerialPort, D: OutputPin> Rs485<P, D> {
    /// Wrap a port; the line starts in receive mode.
    pub fn new(port: P, mut drive_enable: D) -> Self {
        if drive_enable.set_low().is_err() {
            error!("drive enable stuck, transceiver may hold the line");
        }
        Self {
            port,
            drive_enable,
            flush_spins: DEFAULT_FLUSH_SPINS,
        }
    }

    #[must_use]
    pub fn with_flush_spins(mut self, spins: u32) -> Self {
        self.flush_spins = spins;
        self
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn drive_enable(&self) -> &D {
        &self.drive_enable
    }

    pub fn into_parts(self) -> (P, D) {
        (self.port, self.drive_enable)
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), BusError> {
        self.port.write_all(frame).map_err(|_| BusError::Io)?;
        let mut spins = self.flush_spins;
        while self.port.is_transmitting() {
            if spins == 0 {
                return Err(BusError::FlushTimeout);
            }
            spins -= 1;
        }
        Ok(())
    }
}

impl<P: SerialPort, D: OutputPin> Bus for Rs485<P, D> {
    fn read_byte(&mut self) -> Option<u8> {
        self.port.try_read()
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), BusError> {
        self.drive_enable
            .set_high()
            .map_err(|_| BusError::DriveEnable)?;
        let result = self.send(frame);
        // release the line even when the write failed
        let released = self.drive_enable.set_low();
        result?;
        released.map_err(|_| BusError::DriveEnable)
    }

    fn take_overrun(&mut self) -> bool {
        self.port.take_overrun()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) {
        self.port.set_baud_rate(baud_rate);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use core::convert::Infallible;
    use embedded_hal::digital::{ErrorKind, ErrorType};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        DriveHigh,
        DriveLow,
        Write(Vec<u8>),
        Drained,
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct Pin {
        log: Log,
    }

    impl ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.log.borrow_mut().push(Event::DriveLow);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.log.borrow_mut().push(Event::DriveHigh);
            Ok(())
        }
    }

    struct Port {
        log: Log,
        rx: VecDeque<u8>,
        /// polls of `is_transmitting` that still report busy
        busy_polls: u32,
        baud: u32,
    }

    impl SerialPort for Port {
        type Error = ();

        fn try_read(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
            self.log.borrow_mut().push(Event::Write(bytes.to_vec()));
            Ok(())
        }

        fn is_transmitting(&mut self) -> bool {
            if self.busy_polls == 0 {
                self.log.borrow_mut().push(Event::Drained);
                false
            } else {
                self.busy_polls -= 1;
                true
            }
        }

        fn set_baud_rate(&mut self, baud_rate: u32) {
            self.baud = baud_rate;
        }
    }

    fn rs485(busy_polls: u32) -> (Rs485<Port, Pin>, Log) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let port = Port {
            log: log.clone(),
            rx: VecDeque::from(std::vec![0x01, 0x03]),
            busy_polls,
            baud: 115_200,
        };
        let bus = Rs485::new(port, Pin { log: log.clone() });
        log.borrow_mut().clear();
        (bus, log)
    }

    #[test]
    fn test_drive_enable_released_after_drain() {
        let (mut bus, log) = rs485(3);
        bus.transmit(&[0xAA, 0xBB]).unwrap();
        assert_eq!(
            *log.borrow(),
            [
                Event::DriveHigh,
                Event::Write(std::vec![0xAA, 0xBB]),
                Event::Drained,
                Event::DriveLow
            ]
        );
    }

    #[test]
    fn test_flush_timeout_still_releases_line() {
        let (bus, log) = rs485(u32::MAX);
        let mut bus = bus.with_flush_spins(10);
        assert_eq!(bus.transmit(&[0x01]), Err(BusError::FlushTimeout));
        assert_eq!(log.borrow().last(), Some(&Event::DriveLow));
    }

    #[test]
    fn test_reads_and_baud_pass_through() {
        let (mut bus, _log) = rs485(0);
        assert_eq!(bus.read_byte(), Some(0x01));
        assert_eq!(bus.read_byte(), Some(0x03));
        assert_eq!(bus.read_byte(), None);
        assert!(!bus.take_overrun());
        bus.set_baud_rate(9600);
        assert_eq!(bus.port().baud, 9600);
    }

    struct BrokenPin;

    impl ErrorType for BrokenPin {
        type Error = ErrorKind;
    }

    impl OutputPin for BrokenPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }
    }

    #[test]
    fn test_broken_drive_enable_never_writes() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let port = Port {
            log: log.clone(),
            rx: VecDeque::new(),
            busy_polls: 0,
            baud: 115_200,
        };
        let mut bus = Rs485::new(port, BrokenPin);
        assert_eq!(bus.transmit(&[0x01]), Err(BusError::DriveEnable));
        assert!(log.borrow().is_empty());
    }
}
