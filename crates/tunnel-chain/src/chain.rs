use std::collections::HashSet;

use delivery_spec::{DeliveryError, DeliveryResult, DeliverySpec, ServerSpec};

/// Servers to pass through, ordered from the first hop dialed locally to the destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HopChain {
    hops: Vec<ServerSpec>,
}

impl HopChain {
    /// Walks `via` links backwards from `destination_id` until a server without `via`.
    pub fn resolve(spec: &DeliverySpec, destination_id: &str) -> DeliveryResult<Self> {
        let mut current = spec
            .server(destination_id)
            .ok_or_else(|| DeliveryError::config("unknown dst server"))?;
        let mut visited = HashSet::new();
        let mut path = vec![current.id.clone()];
        let mut hops = Vec::new();
        visited.insert(current.id.clone());
        hops.push(current.clone());

        while let Some(via) = current.via.as_deref() {
            if !visited.insert(via.to_string()) {
                path.push(via.to_string());
                return Err(DeliveryError::config(format!(
                    "via cycle detected: {}",
                    path.join(" -> ")
                )));
            }
            let next = spec.server(via).ok_or_else(|| {
                DeliveryError::config(format!(
                    "via server \"{via}\" for server \"{}\" not found",
                    current.id
                ))
            })?;
            path.push(next.id.clone());
            hops.push(next.clone());
            current = next;
        }

        hops.reverse();
        Ok(Self { hops })
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hops(&self) -> &[ServerSpec] {
        &self.hops
    }

    pub fn destination(&self) -> &ServerSpec {
        &self.hops[self.hops.len() - 1]
    }

    /// Consecutive `(gate, target)` pairs; one tunnel is built per pair.
    pub fn links(&self) -> impl Iterator<Item = (&ServerSpec, &ServerSpec)> {
        self.hops.windows(2).map(|pair| (&pair[0], &pair[1]))
    }

    pub fn describe(&self) -> String {
        self.hops
            .iter()
            .map(|hop| hop.id.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
