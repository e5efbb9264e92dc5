// src/io/hfp/mod.rs
//
// HFP transport variant. Same RFCOMM byte stream as SPP, but the device at
// the other end speaks the Hands-Free Profile AT dialect: it will not stay
// happy unless its protocol chatter is answered. The session registers a
// minimal audio-gateway handler set; traffic the driver's intent map does
// not consume is routed here and answered on the write path.

pub mod at;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::io::spp::{start_stream, stop_stream, stream_write, StreamShared};
use crate::io::{SerialEvent, SerialEventSender, SerialTransport, TransportError};
use at::{AtArg, AtCommandHandler, AtCommandResult, AtParser, AtStatus};

// Audio-gateway feature bits from the Hands-Free profile v1.5 BRSF exchange
const BRSF_AG_EC_NR: i64 = 1 << 1;
const BRSF_AG_REJECT_CALL: i64 = 1 << 5;
const BRSF_AG_ENHANCED_CALL_STATUS: i64 = 1 << 6;
const BRSF_AG_ENHANCED_CALL_CONTROL: i64 = 1 << 7;
const BRSF_AG_HF_INDICATORS: i64 = 1 << 10;

/// Extended AT error for "operation not supported" (+CME ERROR).
const CME_OPERATION_NOT_SUPPORTED: i64 = 4;

// ============================================================================
// Protocol state and handlers
// ============================================================================

/// Mutable HFP dialog state shared by the registered handlers.
struct HfpState {
    local_brsf: i64,
    remote_brsf: i64,
    indicators_enabled: bool,
    // extended error reporting (+CME ERROR instead of bare ERROR)
    cmee: bool,
}

impl HfpState {
    fn new() -> HfpState {
        HfpState {
            local_brsf: BRSF_AG_EC_NR
                | BRSF_AG_REJECT_CALL
                | BRSF_AG_ENHANCED_CALL_STATUS
                | BRSF_AG_ENHANCED_CALL_CONTROL
                | BRSF_AG_HF_INDICATORS,
            remote_brsf: 0,
            indicators_enabled: false,
            cmee: false,
        }
    }
}

type SharedState = Arc<Mutex<HfpState>>;

fn cme_error(state: &SharedState, code: i64) -> AtCommandResult {
    if state.lock().map(|s| s.cmee).unwrap_or(false) {
        let mut result = AtCommandResult::new(AtStatus::Unsolicited);
        result.add_response(&format!("+CME ERROR: {}", code));
        result
    } else {
        AtCommandResult::new(AtStatus::Error)
    }
}

struct BrsfHandler {
    state: SharedState,
}

impl BrsfHandler {
    fn send_brsf(&self) -> AtCommandResult {
        let local = self.state.lock().map(|s| s.local_brsf).unwrap_or(0);
        AtCommandResult::with_response(&format!("+BRSF: {}", local))
    }
}

impl AtCommandHandler for BrsfHandler {
    fn handle_set(&mut self, args: &[AtArg]) -> AtCommandResult {
        // AT+BRSF=<handsfree supported features bitmap>: the device reports
        // its features, we answer with ours.
        match args.first().and_then(AtArg::as_int) {
            Some(features) => {
                if let Ok(mut state) = self.state.lock() {
                    state.remote_brsf = features;
                }
            }
            None => tlog!("[hfp] HF didn't send BRSF, assuming 0"),
        }
        self.send_brsf()
    }

    // Out of spec, but do the nice thing
    fn handle_action(&mut self) -> AtCommandResult {
        self.send_brsf()
    }

    fn handle_read(&mut self) -> AtCommandResult {
        self.send_brsf()
    }
}

/// +CMER: of the full 3GPP parameter set only indicator event reporting is
/// supported.
struct CmerHandler {
    state: SharedState,
}

impl AtCommandHandler for CmerHandler {
    fn handle_read(&mut self) -> AtCommandResult {
        let enabled = self
            .state
            .lock()
            .map(|s| s.indicators_enabled)
            .unwrap_or(false);
        AtCommandResult::with_response(&format!(
            "+CMER: 3,0,0,{}",
            if enabled { "1" } else { "0" }
        ))
    }

    fn handle_set(&mut self, args: &[AtArg]) -> AtCommandResult {
        if args.len() < 4 {
            return AtCommandResult::new(AtStatus::Error);
        }
        let ints: Vec<Option<i64>> = args.iter().map(AtArg::as_int).collect();
        if ints[0] == Some(3) && ints[1] == Some(0) && ints[2] == Some(0) {
            match ints[3] {
                Some(0) => {
                    if let Ok(mut state) = self.state.lock() {
                        state.indicators_enabled = false;
                    }
                }
                Some(1) => {
                    if let Ok(mut state) = self.state.lock() {
                        state.indicators_enabled = true;
                    }
                }
                _ => {}
            }
            return AtCommandResult::new(AtStatus::Ok);
        }
        cme_error(&self.state, CME_OPERATION_NOT_SUPPORTED)
    }

    fn handle_test(&mut self) -> AtCommandResult {
        AtCommandResult::with_response("+CMER: (3),(0),(0),(0-1)")
    }
}

struct CmeeHandler {
    state: SharedState,
}

impl AtCommandHandler for CmeeHandler {
    fn handle_action(&mut self) -> AtCommandResult {
        // out of spec, assume they want to enable
        if let Ok(mut state) = self.state.lock() {
            state.cmee = true;
        }
        AtCommandResult::new(AtStatus::Ok)
    }

    fn handle_read(&mut self) -> AtCommandResult {
        let cmee = self.state.lock().map(|s| s.cmee).unwrap_or(false);
        AtCommandResult::with_response(&format!("+CMEE: {}", if cmee { "1" } else { "0" }))
    }

    fn handle_set(&mut self, args: &[AtArg]) -> AtCommandResult {
        match args.first() {
            // <n> omitted - default to 0
            None => {
                if let Ok(mut state) = self.state.lock() {
                    state.cmee = false;
                }
                AtCommandResult::new(AtStatus::Ok)
            }
            Some(AtArg::Int(n)) => {
                if let Ok(mut state) = self.state.lock() {
                    state.cmee = *n == 1;
                }
                AtCommandResult::new(AtStatus::Ok)
            }
            Some(AtArg::Text(_)) => AtCommandResult::new(AtStatus::Error),
        }
    }

    fn handle_test(&mut self) -> AtCommandResult {
        AtCommandResult::with_response("+CMEE: (0-1)")
    }
}

/// +CIND indicator set: fixed healthy-phone answers.
struct CindHandler;

impl AtCommandHandler for CindHandler {
    fn handle_read(&mut self) -> AtCommandResult {
        let mut result = AtCommandResult::new(AtStatus::Ok);
        result.add_response("+CIND: 1,1,0,0,5,0,5,1,0");
        result
    }

    fn handle_test(&mut self) -> AtCommandResult {
        AtCommandResult::with_response(
            "+CIND: (\"service\",(0-1)),(\"call\",(0-1)),\
             (\"callsetup\",(0-3)),(\"callheld\",(0-2)),(\"signal\",(0-5)),\
             (\"roam\",(0-1)),(\"battchg\",(0-5)),(\"message\",(0-1)),(\"smsfull\",(0-2))",
        )
    }
}

/// Legacy signal-quality query.
struct CsqHandler;

impl AtCommandHandler for CsqHandler {
    fn handle_action(&mut self) -> AtCommandResult {
        let mut result = AtCommandResult::new(AtStatus::Ok);
        result.add_response("+CSQ: 31,99");
        result
    }
}

struct CregHandler;

impl AtCommandHandler for CregHandler {
    fn handle_read(&mut self) -> AtCommandResult {
        AtCommandResult::with_response("+CREG: 1,1")
    }
}

/// Bluetooth response-and-hold. Several speaker mics probe it right after
/// the service-level connection; answering OK and querying +PTT=? nudges
/// them into reporting key state.
struct BtrhHandler;

impl AtCommandHandler for BtrhHandler {
    fn handle_read(&mut self) -> AtCommandResult {
        let mut result = AtCommandResult::new(AtStatus::Unsolicited);
        result.add_response("OK");
        result.add_response("+PTT=?");
        result
    }

    fn handle_set(&mut self, _args: &[AtArg]) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
}

/// Microphone gain report: acknowledged, not acted on.
struct VgmHandler;

impl AtCommandHandler for VgmHandler {
    fn handle_set(&mut self, _args: &[AtArg]) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
}

/// Speaker gain report: validated, acknowledged.
struct VgsHandler;

impl AtCommandHandler for VgsHandler {
    fn handle_set(&mut self, args: &[AtArg]) -> AtCommandResult {
        if args.len() != 1 || args[0].as_int().is_none() {
            return AtCommandResult::new(AtStatus::Error);
        }
        AtCommandResult::new(AtStatus::Ok)
    }
}

/// Unknown commands answer OK unconditionally: unsupported optional AT
/// features must not break the link.
struct CatchAllHandler;

impl AtCommandHandler for CatchAllHandler {
    fn handle_basic(&mut self, _arg: &str) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
    fn handle_action(&mut self) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
    fn handle_read(&mut self) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
    fn handle_set(&mut self, _args: &[AtArg]) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
    fn handle_test(&mut self) -> AtCommandResult {
        AtCommandResult::new(AtStatus::Ok)
    }
}

/// Build the audio-gateway parser for one session.
fn build_parser(state: SharedState) -> AtParser {
    let mut parser = AtParser::new();
    parser.register("+BRSF", Box::new(BrsfHandler { state: state.clone() }));
    parser.register("+CMER", Box::new(CmerHandler { state: state.clone() }));
    parser.register("+CMEE", Box::new(CmeeHandler { state }));
    parser.register("+CIND", Box::new(CindHandler));
    parser.register("+CSQ", Box::new(CsqHandler));
    parser.register("+CREG", Box::new(CregHandler));
    parser.register("+BTRH", Box::new(BtrhHandler));
    parser.register("+VGM", Box::new(VgmHandler));
    parser.register("+VGS", Box::new(VgsHandler));
    parser.register("", Box::new(CatchAllHandler));
    parser
}

// ============================================================================
// Transport
// ============================================================================

pub struct HfpTransport {
    port_path: String,
    display_name: String,
    shared: Arc<StreamShared>,
    listener: Mutex<Option<SerialEventSender>>,
    parser: Arc<Mutex<AtParser>>,
}

impl HfpTransport {
    pub fn new(port_path: &str, display_name: &str) -> HfpTransport {
        let state = Arc::new(Mutex::new(HfpState::new()));
        HfpTransport {
            port_path: port_path.to_string(),
            display_name: display_name.to_string(),
            shared: StreamShared::new(),
            listener: Mutex::new(None),
            parser: Arc::new(Mutex::new(build_parser(state))),
        }
    }

    /// Run a raw incoming line through the AT engine and serialize the
    /// result back over the write path.
    pub async fn process_at_commands(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data)
            .replace('\r', "")
            .replace('\n', "");
        let response = {
            match self.parser.lock() {
                Ok(mut parser) => parser.process(&text).to_string(),
                Err(e) => {
                    tlog!("[hfp] parser poisoned: {}", e);
                    return;
                }
            }
        };
        if response.is_empty() {
            return;
        }
        if let Err(e) = stream_write(&self.shared, response.as_bytes()).await {
            tlog!("[hfp] failed to answer AT chatter: {}", e);
        }
    }
}

#[async_trait]
impl SerialTransport for HfpTransport {
    fn name(&self) -> String {
        if self.display_name.is_empty() {
            self.port_path.clone()
        } else {
            self.display_name.clone()
        }
    }

    fn address(&self) -> String {
        self.port_path.clone()
    }

    async fn connect(&mut self, listener: SerialEventSender) -> Result<(), TransportError> {
        tlog!("[hfp] connect {}", self.port_path);
        if let Ok(mut guard) = self.listener.lock() {
            *guard = Some(listener.clone());
        }
        start_stream(&self.port_path, &self.shared, listener).await
    }

    async fn disconnect(&mut self, silent: bool) {
        tlog!("[hfp] disconnect {} (silent: {})", self.port_path, silent);
        stop_stream(&self.shared).await;
        if !silent {
            if let Ok(guard) = self.listener.lock() {
                if let Some(listener) = guard.as_ref() {
                    let _ = listener.send(SerialEvent::Disconnected);
                }
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        stream_write(&self.shared, data).await
    }

    async fn handle_unmapped(&self, data: &[u8]) -> bool {
        self.process_at_commands(data).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> AtParser {
        build_parser(Arc::new(Mutex::new(HfpState::new())))
    }

    #[test]
    fn test_brsf_negotiation() {
        let mut parser = parser();
        let out = parser.process("AT+BRSF=0").to_string();
        // Reply names our features, then OK
        assert!(out.contains("+BRSF: "), "got: {out}");
        assert!(out.ends_with("OK\r\n"), "got: {out}");
        let expected = BRSF_AG_EC_NR
            | BRSF_AG_REJECT_CALL
            | BRSF_AG_ENHANCED_CALL_STATUS
            | BRSF_AG_ENHANCED_CALL_CONTROL
            | BRSF_AG_HF_INDICATORS;
        assert!(out.contains(&format!("+BRSF: {}", expected)));
    }

    #[test]
    fn test_cmer_enables_indicators() {
        let mut parser = parser();
        assert_eq!(parser.process("AT+CMER=3,0,0,1").to_string(), "\r\nOK\r\n");
        assert!(parser.process("AT+CMER?").to_string().contains("+CMER: 3,0,0,1"));
        assert_eq!(parser.process("AT+CMER=3,0,0,0").to_string(), "\r\nOK\r\n");
        assert!(parser.process("AT+CMER?").to_string().contains("+CMER: 3,0,0,0"));
    }

    #[test]
    fn test_cmer_unsupported_mode_reports_error() {
        let mut parser = parser();
        assert_eq!(parser.process("AT+CMER=1,0,0,1").to_string(), "\r\nERROR\r\n");
        // With extended errors enabled the failure carries a CME code
        assert_eq!(parser.process("AT+CMEE=1").to_string(), "\r\nOK\r\n");
        let out = parser.process("AT+CMER=1,0,0,1").to_string();
        assert!(out.contains("+CME ERROR: 4"), "got: {out}");
    }

    #[test]
    fn test_cind_read_and_test() {
        let mut parser = parser();
        let read = parser.process("AT+CIND?").to_string();
        assert!(read.contains("+CIND: 1,1,0,0,5,0,5,1,0"));
        assert!(read.ends_with("OK\r\n"));
        let test = parser.process("AT+CIND=?").to_string();
        assert!(test.contains("\"callsetup\""));
    }

    #[test]
    fn test_btrh_probes_for_ptt() {
        let mut parser = parser();
        let out = parser.process("AT+BTRH?").to_string();
        assert!(out.contains("OK"));
        assert!(out.contains("+PTT=?"));
        // Unsolicited: no trailing final code beyond the embedded OK
        assert!(!out.ends_with("ERROR\r\n"));
    }

    #[test]
    fn test_vgs_validates_argument() {
        let mut parser = parser();
        assert_eq!(parser.process("AT+VGS=9").to_string(), "\r\nOK\r\n");
        assert_eq!(parser.process("AT+VGS=loud").to_string(), "\r\nERROR\r\n");
    }

    #[test]
    fn test_unknown_chatter_gets_ok() {
        let mut parser = parser();
        assert_eq!(parser.process("AT+XEVENT=battery,5").to_string(), "\r\nOK\r\n");
        assert_eq!(parser.process("AT+NREC=0").to_string(), "\r\nOK\r\n");
    }
}
