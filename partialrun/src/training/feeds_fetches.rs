use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::graph::{Graph, ValueId};
use crate::runtime::OutputAllocator;

/// Static binding of feed and fetch names to graph values.
///
/// Built once per partial configuration and never mutated by a run.
#[derive(Clone)]
pub struct FeedsFetchesManager {
    feed_names: Vec<String>,
    feed_ids: Vec<ValueId>,
    fetch_names: Vec<String>,
    fetch_ids: Vec<ValueId>,
    fetch_devices: Vec<Device>,
    fetch_allocators: Vec<Option<Arc<dyn OutputAllocator>>>,
}

fn resolve<S: AsRef<str>>(
    graph: &Graph,
    kind: &str,
    names: &[S],
) -> Result<(Vec<String>, Vec<ValueId>)> {
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        let id = graph
            .value_id(name)
            .ok_or_else(|| Error::invalid(format!("unknown {} name {}", kind, name)))?;
        if ids.contains(&id) {
            return Err(Error::invalid(format!("duplicate {} name {}", kind, name)));
        }
        ids.push(id);
    }
    let names = names.iter().map(|name| name.as_ref().to_string()).collect();
    Ok((names, ids))
}

impl FeedsFetchesManager {
    /// Bind names to value ids. An empty `output_device_info` places every
    /// fetch on the host.
    pub fn create<S: AsRef<str>>(
        graph: &Graph,
        feed_names: &[S],
        fetch_names: &[S],
        output_device_info: &[Device],
    ) -> Result<Self> {
        let (feed_names, feed_ids) = resolve(graph, "feed", feed_names)?;
        let (fetch_names, fetch_ids) = resolve(graph, "fetch", fetch_names)?;
        let fetch_devices = if output_device_info.is_empty() {
            vec![Device::Cpu; fetch_ids.len()]
        } else if output_device_info.len() == fetch_ids.len() {
            output_device_info.to_vec()
        } else {
            return Err(Error::invalid(format!(
                "{} output devices given for {} fetches",
                output_device_info.len(),
                fetch_ids.len()
            )));
        };
        let fetch_allocators = vec![None; fetch_ids.len()];
        Ok(Self {
            feed_names,
            feed_ids,
            fetch_names,
            fetch_ids,
            fetch_devices,
            fetch_allocators,
        })
    }

    /// Route one fetch through a custom allocator.
    pub fn with_output_allocator(
        mut self,
        fetch_name: &str,
        allocator: Arc<dyn OutputAllocator>,
    ) -> Result<Self> {
        let slot = self
            .fetch_names
            .iter()
            .position(|name| name == fetch_name)
            .ok_or_else(|| Error::invalid(format!("{} is not a fetch", fetch_name)))?;
        self.fetch_allocators[slot] = Some(allocator);
        Ok(self)
    }

    pub fn feed_names(&self) -> &[String] {
        &self.feed_names
    }

    pub fn feed_ids(&self) -> &[ValueId] {
        &self.feed_ids
    }

    pub fn fetch_names(&self) -> &[String] {
        &self.fetch_names
    }

    pub fn fetch_ids(&self) -> &[ValueId] {
        &self.fetch_ids
    }

    pub fn fetch_devices(&self) -> &[Device] {
        &self.fetch_devices
    }

    pub(crate) fn fetch_allocators(&self) -> Vec<Option<&dyn OutputAllocator>> {
        self.fetch_allocators
            .iter()
            .map(|allocator| allocator.as_deref())
            .collect()
    }
}

impl fmt::Debug for FeedsFetchesManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedsFetchesManager")
            .field("feeds", &self.feed_names)
            .field("fetches", &self.fetch_names)
            .field("devices", &self.fetch_devices)
            .field(
                "custom_allocators",
                &self.fetch_allocators.iter().filter(|a| a.is_some()).count(),
            )
            .finish()
    }
}
