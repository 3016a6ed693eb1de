use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Which core a pool slot should be pinned to, if any.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorePickPolicy {
    /// Leave scheduling to the OS.
    None,
    /// Slot `i` goes to core `i % cores`.
    RoundRobin,
    /// Every slot on the same core.
    Specific(usize),
}

impl Default for CorePickPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl CorePickPolicy {
    /// Resolve the core id for pool slot `index`, given `cores` available ids.
    pub fn core_for(&self, index: usize, cores: usize) -> Option<usize> {
        match *self {
            CorePickPolicy::None => None,
            CorePickPolicy::RoundRobin if cores > 0 => Some(index % cores),
            CorePickPolicy::RoundRobin => None,
            CorePickPolicy::Specific(id) => Some(id),
        }
    }
}

/// Number of cores the OS lets us pin to.
pub fn available_cores() -> usize {
    get_core_ids().map(|ids| ids.len()).unwrap_or(0)
}

/// Pin the calling thread to `core_id`.
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    if let Some(core_ids) = get_core_ids()
        && core_ids.iter().any(|c| c.id == core_id)
        && set_for_current(CoreId { id: core_id })
    {
        return Ok(core_id);
    }
    Err(anyhow::anyhow!("failed to pin core {core_id}"))
}

#[cfg(test)]
mod tests {
    use super::CorePickPolicy;

    #[test]
    fn round_robin_wraps() {
        let p = CorePickPolicy::RoundRobin;
        assert_eq!(p.core_for(0, 4), Some(0));
        assert_eq!(p.core_for(5, 4), Some(1));
        assert_eq!(p.core_for(5, 0), None);
        assert_eq!(CorePickPolicy::None.core_for(3, 4), None);
        assert_eq!(CorePickPolicy::Specific(2).core_for(9, 4), Some(2));
    }
}
