//! RTU responder: turns delimited frames into register reads/writes and
//! responses.
//!
//! The dispatcher owns the diagnostic registers (`diag_*`). It never blocks:
//! each [`Dispatcher::poll`] drains whatever bytes the UART holds and then
//! processes at most one closed frame.

use crate::bus::Bus;
use crate::registers::{holding, Bank, RegisterMap};
use rtu_proto::{
    exception_response, identification_response, read_response, write_multiple_response,
    write_single_response, CharTiming, Delimited, DelimiterState, ExceptionCode, Frame,
    FrameDelimiter, FunctionCode, IdentityText, Request, ResponseFrame, SerialConfig,
    SerializeError, MAX_FRAME_LEN,
};

/// Bytes drained from the UART per poll.
pub const MAX_BYTES_PER_POLL: usize = 2 * MAX_FRAME_LEN;

pub struct Dispatcher {
    delimiter: FrameDelimiter,
    /// Body of identification responses.
    identity: IdentityText,
    /// Duration written to `identify_secs` by the identify-info function.
    identify_secs: u16,
}

impl Dispatcher {
    #[must_use]
    pub fn new(serial: &SerialConfig, identity: IdentityText, identify_secs: u16) -> Self {
        Self {
            delimiter: FrameDelimiter::new(CharTiming::new(serial)),
            identity,
            identify_secs,
        }
    }

    /// Replace the identification text, e.g. once the stored serial and
    /// alias are known.
    pub fn set_identity(&mut self, identity: IdentityText) {
        self.identity = identity;
    }

    /// Recompute silence thresholds after a line rate change.
    pub fn set_serial_config(&mut self, serial: &SerialConfig) {
        self.delimiter.set_timing(CharTiming::new(serial));
    }

    #[must_use]
    pub fn state(&self, now_us: u64) -> DelimiterState {
        self.delimiter.state(now_us)
    }

    /// One scheduler cycle: take in newly received bytes, then close and
    /// answer the frame if the line has stayed silent since the last byte.
    ///
    /// Draining first restarts the silence clock, so a frame whose tail was
    /// still queued when the cycle began is never split.
    pub fn poll<B: Bus>(&mut self, bus: &mut B, regs: &mut RegisterMap, now_us: u64) {
        if bus.take_overrun() {
            debug!("uart overrun");
            regs.increment_saturating(Bank::Holding, holding::DIAG_OVERRUNS);
        }

        for _ in 0..MAX_BYTES_PER_POLL {
            let Some(byte) = bus.read_byte() else {
                break;
            };
            self.delimiter.push(byte, now_us);
        }

        if let Some(delimited) = self.delimiter.take_frame(now_us) {
            self.process(delimited, bus, regs);
        }

        let anomalies = u16::try_from(self.delimiter.anomalies()).unwrap_or(u16::MAX);
        regs.set(Bank::Holding, holding::DIAG_FRAMING_ANOMALIES, anomalies);
    }

    fn process<B: Bus>(&mut self, delimited: Delimited, bus: &mut B, regs: &mut RegisterMap) {
        let bytes = match delimited {
            Delimited::Frame(bytes) => bytes,
            Delimited::Overrun => {
                debug!("frame exceeded receive buffer");
                regs.increment_saturating(Bank::Holding, holding::DIAG_OVERRUNS);
                return;
            }
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping frame: {:?}", e);
                regs.increment_saturating(Bank::Holding, holding::DIAG_CRC_ERRORS);
                return;
            }
        };

        let unit_id = regs.get(Bank::Holding, holding::UNIT_ID);
        if !frame.is_broadcast() && u16::from(frame.unit) != unit_id {
            return;
        }
        regs.increment_saturating(Bank::Holding, holding::DIAG_RX_FRAMES);

        let result = self.handle(&frame, regs);
        if frame.is_broadcast() {
            return;
        }

        let response = match result {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(code) => {
                debug!("exception {:?} for function {}", code, frame.function);
                regs.increment_saturating(Bank::Holding, holding::DIAG_EXCEPTIONS);
                regs.set(Bank::Holding, holding::DIAG_LAST_EXCEPTION, u16::from(code.as_u8()));
                match built(exception_response(frame.unit, frame.function, code)) {
                    Some(response) => response,
                    None => return,
                }
            }
        };

        match bus.transmit(&response) {
            Ok(()) => regs.increment_saturating(Bank::Holding, holding::DIAG_TX_FRAMES),
            Err(e) => warn!("transmit failed: {:?}", e),
        }
    }

    /// Execute a request. `Ok(None)` means nothing to send.
    fn handle(
        &self,
        frame: &Frame<'_>,
        regs: &mut RegisterMap,
    ) -> Result<Option<ResponseFrame>, ExceptionCode> {
        let request = Request::parse(frame.function, frame.payload)?;
        let function = request.function();
        if frame.is_broadcast() && !function.accepts_broadcast() {
            return Ok(None);
        }
        let unit = frame.unit;

        let response = match request {
            Request::ReadHolding { start, count } => {
                read_response(unit, function, regs.read(Bank::Holding, start, count)?)
            }
            Request::ReadInput { start, count } => {
                read_response(unit, function, regs.read(Bank::Input, start, count)?)
            }
            Request::WriteSingle { address, value } => {
                regs.write(address, value)?;
                write_single_response(unit, address, value)
            }
            Request::WriteMultiple { start, values } => {
                regs.write_multiple(start, values.iter())?;
                // bounded by MAX_REGISTERS_PER_REQUEST
                write_multiple_response(unit, start, values.len() as u16)
            }
            Request::ReportServerId => {
                identification_response(unit, function, self.identity.as_bytes())
            }
            Request::IdentifyInfo => {
                regs.write(holding::IDENTIFY_SECS, self.identify_secs)?;
                identification_response(unit, FunctionCode::IdentifyInfo, self.identity.as_bytes())
            }
        };
        Ok(built(response))
    }
}

fn built(response: Result<ResponseFrame, SerializeError>) -> Option<ResponseFrame> {
    match response {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("response build failed: {:?}", e);
            None
        }
    }
}
