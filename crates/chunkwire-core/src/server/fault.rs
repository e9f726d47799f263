//! Deliberate payload corruption for exercising the client's retry path.
//!
//! Faults flip one payload bit after the checksum has been computed, so the
//! receiver sees a well-formed packet whose payload no longer matches its
//! declared checksum. The declared length is never altered.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Corrupt the chunk with `sequence` the next `times` times it is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedFault {
    /// Restrict the fault to one file; `None` matches any file
    pub file: Option<String>,
    /// Chunk sequence to corrupt
    pub sequence: u32,
    /// How many servings to corrupt
    pub times: u32,
}

/// Which packets get corrupted
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FaultPlan {
    /// Never corrupt
    #[default]
    None,
    /// Corrupt each packet independently with this probability
    Random {
        /// Probability in `[0.0, 1.0]`
        probability: f64,
    },
    /// Corrupt specific chunks a fixed number of times
    Scripted(Vec<ScriptedFault>),
}

/// Applies a [`FaultPlan`] to outgoing packets
#[derive(Debug)]
pub struct FaultInjector {
    plan: FaultPlan,
    remaining: Mutex<Vec<ScriptedFault>>,
    rng: Mutex<SmallRng>,
}

impl FaultInjector {
    /// Create an injector seeded from the OS
    #[must_use]
    pub fn new(plan: FaultPlan) -> Self {
        Self::with_rng(plan, SmallRng::from_entropy())
    }

    /// Create an injector with a fixed seed
    #[must_use]
    pub fn with_seed(plan: FaultPlan, seed: u64) -> Self {
        Self::with_rng(plan, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(plan: FaultPlan, rng: SmallRng) -> Self {
        let remaining = match &plan {
            FaultPlan::Scripted(faults) => faults.clone(),
            _ => Vec::new(),
        };
        Self {
            plan,
            remaining: Mutex::new(remaining),
            rng: Mutex::new(rng),
        }
    }

    /// Whether any fault can ever fire
    #[must_use]
    pub fn is_active(&self) -> bool {
        match &self.plan {
            FaultPlan::None => false,
            FaultPlan::Random { probability } => *probability > 0.0,
            FaultPlan::Scripted(_) => !self.remaining.lock().is_empty(),
        }
    }

    /// Decide whether to corrupt this serving and, if so, flip one bit.
    ///
    /// Returns `true` when the payload was modified. Empty payloads are never
    /// modified.
    pub fn apply(&self, file: &str, sequence: u32, payload: &mut [u8]) -> bool {
        if payload.is_empty() || !self.should_corrupt(file, sequence) {
            return false;
        }

        let mut rng = self.rng.lock();
        let byte = rng.gen_range(0..payload.len());
        let bit = rng.gen_range(0..8u8);
        payload[byte] ^= 1 << bit;
        true
    }

    fn should_corrupt(&self, file: &str, sequence: u32) -> bool {
        match &self.plan {
            FaultPlan::None => false,
            FaultPlan::Random { probability } => {
                let p = probability.clamp(0.0, 1.0);
                self.rng.lock().gen_bool(p)
            }
            FaultPlan::Scripted(_) => {
                let mut remaining = self.remaining.lock();
                let hit = remaining.iter_mut().find(|f| {
                    f.sequence == sequence
                        && f.times > 0
                        && f.file.as_deref().is_none_or(|name| name == file)
                });
                match hit {
                    Some(fault) => {
                        fault.times -= 1;
                        remaining.retain(|f| f.times > 0);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new(FaultPlan::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_corrupts() {
        let injector = FaultInjector::new(FaultPlan::None);
        let mut payload = vec![0u8; 32];
        for seq in 0..100 {
            assert!(!injector.apply("a", seq, &mut payload));
        }
        assert!(payload.iter().all(|&b| b == 0));
        assert!(!injector.is_active());
    }

    #[test]
    fn test_scripted_fires_exact_count() {
        let injector = FaultInjector::with_seed(
            FaultPlan::Scripted(vec![ScriptedFault {
                file: None,
                sequence: 2,
                times: 2,
            }]),
            7,
        );

        let original = vec![0x55u8; 64];
        let mut fired = 0;
        for _ in 0..5 {
            let mut payload = original.clone();
            if injector.apply("x.bin", 2, &mut payload) {
                fired += 1;
                let flipped: u32 = payload
                    .iter()
                    .zip(&original)
                    .map(|(a, b)| (a ^ b).count_ones())
                    .sum();
                assert_eq!(flipped, 1);
            } else {
                assert_eq!(payload, original);
            }
        }
        assert_eq!(fired, 2);
        assert!(!injector.is_active());
    }

    #[test]
    fn test_scripted_respects_file_filter() {
        let injector = FaultInjector::new(FaultPlan::Scripted(vec![ScriptedFault {
            file: Some("target.bin".to_string()),
            sequence: 0,
            times: 1,
        }]));
        let mut payload = vec![1u8; 8];
        assert!(!injector.apply("other.bin", 0, &mut payload));
        assert!(!injector.apply("target.bin", 1, &mut payload));
        assert!(injector.apply("target.bin", 0, &mut payload));
    }

    #[test]
    fn test_random_certain_and_never() {
        let always = FaultInjector::with_seed(FaultPlan::Random { probability: 1.0 }, 1);
        let never = FaultInjector::with_seed(FaultPlan::Random { probability: 0.0 }, 1);
        let mut payload = vec![0u8; 16];
        assert!(always.apply("a", 0, &mut payload));
        assert!(!never.apply("a", 0, &mut payload));
    }

    #[test]
    fn test_empty_payload_untouched() {
        let injector = FaultInjector::with_seed(FaultPlan::Random { probability: 1.0 }, 3);
        assert!(!injector.apply("a", 0, &mut []));
    }
}
