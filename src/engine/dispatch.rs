//! Client selection policies for competing-consumer dispatch.

use crate::core::DispatchPolicy;
use crate::engine::clients::ClientRegistry;

/// Rotating or sticky cursor over the registry's insertion order.
pub struct DispatchCursor {
    policy: DispatchPolicy,
    position: usize,
}

impl DispatchCursor {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            position: 0,
        }
    }

    /// Pick the client for the next event, or `None` when every client is
    /// saturated (or the registry is empty).
    pub fn select(&mut self, registry: &ClientRegistry) -> Option<usize> {
        let len = registry.len();
        if len == 0 {
            return None;
        }
        if self.position >= len {
            self.position = 0;
        }
        match self.policy {
            DispatchPolicy::RoundRobin => {
                for offset in 0..len {
                    let index = (self.position + offset) % len;
                    if registry.at(index).is_some_and(|c| c.has_capacity()) {
                        self.position = (index + 1) % len;
                        return Some(index);
                    }
                }
                None
            }
            DispatchPolicy::DispatchToSingle => {
                // The sticky client takes everything until it saturates;
                // only then does the cursor fall through, re-pinning on the
                // next client in insertion order.
                for offset in 0..len {
                    let index = (self.position + offset) % len;
                    if registry.at(index).is_some_and(|c| c.has_capacity()) {
                        self.position = index;
                        return Some(index);
                    }
                }
                None
            }
        }
    }

    /// Keep the cursor in range after a removal at `index`. The sticky pin
    /// slides to the client that took the removed slot.
    pub fn client_removed(&mut self, index: usize, remaining: usize) {
        if index < self.position {
            self.position -= 1;
        }
        if remaining == 0 || self.position >= remaining {
            self.position = 0;
        }
    }
}
