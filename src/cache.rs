//! Per-step cache for reference attention features.
//!
//! During a denoising step the reference denoiser stores the key/value
//! tensors of every self-attention layer in an [`AttentionCache`]; the main
//! denoiser then reads them back in its paired forward pass. The cache is
//! reset and fully rewritten at every timestep, it never carries state from
//! one step to the next.

use candle::{Result, Tensor};

/// Identifier for a self-attention layer, assigned at model-build time.
///
/// Both denoiser copies register their self-attention layers in construction
/// order, so the n-th layer of the reference denoiser and the n-th layer of
/// the main denoiser share the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(usize);

impl LayerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assigns dense layer ids while a denoiser is being built.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    self_attn: usize,
    cross_attn: usize,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_self_attn(&mut self) -> LayerId {
        let id = LayerId(self.self_attn);
        self.self_attn += 1;
        id
    }

    pub fn register_cross_attn(&mut self) -> usize {
        let index = self.cross_attn;
        self.cross_attn += 1;
        index
    }

    pub fn self_attn_layers(&self) -> usize {
        self.self_attn
    }

    pub fn cross_attn_layers(&self) -> usize {
        self.cross_attn
    }
}

/// Key/value tensors captured by the reference denoiser, one slot per
/// self-attention layer. Slots are write-once between resets.
#[derive(Debug)]
pub struct AttentionCache {
    slots: Vec<Option<(Tensor, Tensor)>>,
}

impl AttentionCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            slots: vec![None; num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.slots.len()
    }

    /// Drops all entries. Must run before every reference pass so that the
    /// pass rewrites the cache in full and no stale step leaks through.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None
        }
    }

    pub fn put(&mut self, id: LayerId, key: Tensor, value: Tensor) -> Result<()> {
        let num_layers = self.slots.len();
        let slot = match self.slots.get_mut(id.index()) {
            Some(slot) => slot,
            None => candle::bail!(
                "self-attention layer {id} does not fit the reference layout ({num_layers} layers)"
            ),
        };
        if slot.is_some() {
            candle::bail!(
                "reference features for self-attention layer {id} written twice in one step"
            )
        }
        *slot = Some((key, value));
        Ok(())
    }

    pub fn get(&self, id: LayerId) -> Result<(&Tensor, &Tensor)> {
        match self.slots.get(id.index()) {
            Some(Some((key, value))) => Ok((key, value)),
            Some(None) => candle::bail!(
                "no cached reference features for self-attention layer {id}, \
                 the reference pass must complete before the main pass"
            ),
            None => candle::bail!(
                "self-attention layer {id} does not match the reference layout ({} layers)",
                self.slots.len()
            ),
        }
    }

    pub fn is_fully_populated(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn kv(device: &Device, seed: f32) -> (Tensor, Tensor) {
        let key = Tensor::full(seed, (1, 4, 8), device).unwrap();
        let value = Tensor::full(-seed, (1, 4, 8), device).unwrap();
        (key, value)
    }

    #[test]
    fn registry_assigns_dense_ids() {
        let mut registry = LayerRegistry::new();
        let ids: Vec<_> = (0..5).map(|_| registry.register_self_attn()).collect();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(id.index(), i);
        }
        assert_eq!(registry.self_attn_layers(), 5);
        assert_eq!(registry.register_cross_attn(), 0);
        assert_eq!(registry.register_cross_attn(), 1);
        assert_eq!(registry.cross_attn_layers(), 2);
    }

    #[test]
    fn put_then_get_roundtrips() {
        let device = Device::Cpu;
        let mut registry = LayerRegistry::new();
        let id = registry.register_self_attn();
        let mut cache = AttentionCache::new(registry.self_attn_layers());
        assert!(!cache.is_fully_populated());
        let (key, value) = kv(&device, 1.0);
        cache.put(id, key.clone(), value.clone()).unwrap();
        assert!(cache.is_fully_populated());
        let (k, v) = cache.get(id).unwrap();
        assert_eq!(
            k.to_vec3::<f32>().unwrap(),
            key.to_vec3::<f32>().unwrap()
        );
        assert_eq!(
            v.to_vec3::<f32>().unwrap(),
            value.to_vec3::<f32>().unwrap()
        );
    }

    #[test]
    fn double_write_in_one_step_fails() {
        let device = Device::Cpu;
        let mut registry = LayerRegistry::new();
        let id = registry.register_self_attn();
        let mut cache = AttentionCache::new(registry.self_attn_layers());
        let (key, value) = kv(&device, 1.0);
        cache.put(id, key.clone(), value.clone()).unwrap();
        assert!(cache.put(id, key, value).is_err());
    }

    #[test]
    fn reset_allows_full_rewrite() {
        let device = Device::Cpu;
        let mut registry = LayerRegistry::new();
        let id = registry.register_self_attn();
        let mut cache = AttentionCache::new(registry.self_attn_layers());
        let (key, value) = kv(&device, 2.0);
        cache.put(id, key.clone(), value.clone()).unwrap();
        cache.reset();
        assert!(!cache.is_fully_populated());
        // Writing the same content again after reset reproduces the same
        // cache, i.e. a repeated reference pass is idempotent.
        cache.put(id, key.clone(), value).unwrap();
        let (k, _) = cache.get(id).unwrap();
        assert_eq!(
            k.to_vec3::<f32>().unwrap(),
            key.to_vec3::<f32>().unwrap()
        );
    }

    #[test]
    fn read_of_unwritten_slot_fails() {
        let mut registry = LayerRegistry::new();
        let id = registry.register_self_attn();
        let _other = registry.register_self_attn();
        let cache = AttentionCache::new(registry.self_attn_layers());
        let err = cache.get(id).unwrap_err().to_string();
        assert!(err.contains("reference pass"), "{err}");
    }

    #[test]
    fn out_of_range_id_fails() {
        let mut registry = LayerRegistry::new();
        for _ in 0..3 {
            registry.register_self_attn();
        }
        let stray = registry.register_self_attn();
        // A cache sized for a smaller layout must reject the stray id.
        let cache = AttentionCache::new(3);
        assert!(cache.get(stray).is_err());
    }
}
