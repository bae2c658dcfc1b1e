//! Concurrent-transmission flooding abstraction.
//!
//! A flooding implementation owns the physical radio, the slot timer and the
//! flood schedule. Per slot it performs one transmit or receive attempt and
//! then hands the outcome to the registered [`SlotHandler`]; the handler's
//! return value selects the radio state for the next slot.

/// Error codes surfaced by flooding implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    NotSupported,
    InvalidParam,
    PayloadTooLarge,
    HardwareFault,
    Timeout,
}

/// Radio state of a node within one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosState {
    /// Before the first slot of a round.
    Init,
    /// Listening.
    Rx,
    /// Transmitting the current payload.
    Tx,
    /// Done for this round, radio off.
    Off,
}

/// Static parameters of one flooding round.
#[derive(Debug, Clone, Copy)]
pub struct RoundParams {
    pub round_number: u16,
    pub app_id: u8,
    /// Exact on-air payload length in bytes.
    pub payload_len: usize,
    /// Slot length in DCO clock ticks.
    pub slot_len_dco: u32,
    /// Hard cap on the number of slots.
    pub max_slots: u16,
    /// Length of the per-index flag region inside the payload.
    pub flags_len: usize,
}

/// Per-slot callback contract implemented by the protocol core.
///
/// `current` is the state the radio was in during this slot and
/// `txrx_success` tells whether that attempt succeeded. `rx_payload` holds
/// the received bytes when a reception succeeded; `tx_payload` is the
/// buffer the flooding layer will transmit next, and the handler must
/// (re-)encode into it whenever it returns [`ChaosState::Tx`].
pub trait SlotHandler {
    fn process_slot(
        &mut self,
        round_number: u16,
        slot: u16,
        current: ChaosState,
        txrx_success: bool,
        rx_payload: &[u8],
        tx_payload: &mut [u8],
    ) -> ChaosState;
}

/// A flooding layer drives one whole round: it seeds the transmit buffer,
/// calls the handler once per slot, and returns the last processed slot.
pub trait Flooding {
    fn round(
        &mut self,
        params: &RoundParams,
        tx_seed: &[u8],
        handler: &mut dyn SlotHandler,
    ) -> Result<u16, RadioError>;
}

/// Software stub without any radio: every listening slot receives the
/// node's own payload back. Enough to drive a full single-node round on
/// the host, mirroring the hardware slot cadence.
#[derive(Debug, Default)]
pub struct LoopbackFlooding;

impl Flooding for LoopbackFlooding {
    fn round(
        &mut self,
        params: &RoundParams,
        tx_seed: &[u8],
        handler: &mut dyn SlotHandler,
    ) -> Result<u16, RadioError> {
        if params.max_slots == 0 {
            return Err(RadioError::InvalidParam);
        }
        let mut tx_buf = alloc::vec::Vec::from(tx_seed);
        let mut state = ChaosState::Init;
        let mut last = 0;
        for slot in 0..params.max_slots {
            let rx_buf = tx_buf.clone();
            let success = !matches!(state, ChaosState::Init);
            let next = handler.process_slot(
                params.round_number,
                slot,
                state,
                success,
                &rx_buf,
                &mut tx_buf,
            );
            last = slot;
            if next == ChaosState::Off {
                break;
            }
            state = next;
        }
        Ok(last)
    }
}
