//! Energy accounting (spec §2's "radio adapter... charge accounting",
//! §4.3's per-slot charging). Units are relative charge counters, not
//! joules — comparable across nodes within one run, not an absolute
//! hardware measurement.

#[derive(Debug, Default, Clone, Copy)]
pub struct EnergyCounters {
    pub tx: u64,
    pub tx_data: u64,
    pub rx: u64,
    pub rx_data: u64,
    pub idle_listen: u64,
    pub sleep: u64,
}

/// Relative per-activation charge, roughly modeled on typical TSCH radio
/// duty-cycle ratios (a sleeping radio costs far less than an active one).
const CHARGE_TX: u64 = 50;
const CHARGE_TX_DATA: u64 = 10;
const CHARGE_RX: u64 = 55;
const CHARGE_RX_DATA: u64 = 10;
const CHARGE_IDLE_LISTEN: u64 = 55;
const CHARGE_SLEEP: u64 = 1;

impl EnergyCounters {
    pub fn charge_tx(&mut self, with_payload: bool) {
        self.tx += CHARGE_TX;
        if with_payload {
            self.tx_data += CHARGE_TX_DATA;
        }
    }

    pub fn charge_rx(&mut self, with_payload: bool) {
        self.rx += CHARGE_RX;
        if with_payload {
            self.rx_data += CHARGE_RX_DATA;
        }
    }

    pub fn charge_idle_listen(&mut self) {
        self.idle_listen += CHARGE_IDLE_LISTEN;
    }

    pub fn charge_sleep(&mut self) {
        self.sleep += CHARGE_SLEEP;
    }

    pub fn total(&self) -> u64 {
        self.tx + self.tx_data + self.rx + self.rx_data + self.idle_listen + self.sleep
    }
}
