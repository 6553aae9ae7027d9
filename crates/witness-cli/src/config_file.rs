use compact_str::CompactString;
use facet::Facet;
use witness::{BlessedPair, CheckMode, OrderHint, WitnessConfig};

/// Checker settings read from JSON. Anything left out keeps its default.
#[derive(Facet, Debug, Default)]
pub(crate) struct ConfigFile {
    #[facet(default)]
    witness_capacity: Option<u32>,
    #[facet(default)]
    lock_blocks: Option<u32>,
    #[facet(default)]
    order_log_capacity: Option<u32>,
    #[facet(default)]
    mode: Option<CheckMode>,
    #[facet(default)]
    panic_on_violation: Option<bool>,
    #[facet(default)]
    skip_spin: Option<bool>,
    #[facet(default)]
    trace: Option<bool>,
    #[facet(default)]
    blessed: Vec<BlessedPair>,
    #[facet(default)]
    order_hints: Vec<OrderHint>,
}

impl ConfigFile {
    pub(crate) fn load(path: &CompactString) -> Result<Self, String> {
        let text = std::fs::read_to_string(path.as_str()).map_err(|e| format!("read {path}: {e}"))?;
        Self::parse(&text).map_err(|e| format!("{path}: {e}"))
    }

    fn parse(text: &str) -> Result<Self, String> {
        facet_json::from_str(text).map_err(|e| format!("decode config: {e}"))
    }

    pub(crate) fn apply(self, config: &mut WitnessConfig) {
        if let Some(capacity) = self.witness_capacity {
            config.witness_capacity = capacity;
        }
        if let Some(blocks) = self.lock_blocks {
            config.lock_blocks = blocks;
        }
        if let Some(capacity) = self.order_log_capacity {
            config.order_log_capacity = capacity;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(on) = self.panic_on_violation {
            config.panic_on_violation = on;
        }
        if let Some(on) = self.skip_spin {
            config.skip_spin = on;
        }
        if let Some(on) = self.trace {
            config.trace = on;
        }
        config.blessed.extend(self.blessed);
        config.order_hints.extend(self.order_hints);
    }
}
