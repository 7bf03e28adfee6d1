//! Per `(task, dataset)` decoder lookup.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::decoder::TransformerDecoder;
use crate::error::{Result, TransformerError};

/// A registered decoder: either the one canonical shared instance or an
/// independently parameterized copy.
#[derive(Debug, Clone)]
pub enum DecoderHandle {
    Shared(Arc<TransformerDecoder>),
    Owned(TransformerDecoder),
}

impl Deref for DecoderHandle {
    type Target = TransformerDecoder;

    fn deref(&self) -> &Self::Target {
        match self {
            DecoderHandle::Shared(decoder) => decoder,
            DecoderHandle::Owned(decoder) => decoder,
        }
    }
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    decoder: DecoderHandle,
    num_queries: usize,
}

/// Two-level `task → dataset → decoder` map, fixed at construction.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    entries: BTreeMap<String, BTreeMap<String, RegistryEntry>>,
    shared: Option<Arc<TransformerDecoder>>,
}

impl DecoderRegistry {
    /// Build one entry per `(task, dataset)` pair in `num_queries`.
    ///
    /// With `share` set, `build_decoder` runs once and every pair points at that
    /// decoder. Otherwise it runs once per pair.
    pub fn build<F>(
        num_queries: &BTreeMap<String, BTreeMap<String, usize>>,
        share: bool,
        mut build_decoder: F,
    ) -> Result<Self>
    where
        F: FnMut() -> Result<TransformerDecoder>,
    {
        let shared = if share {
            Some(Arc::new(build_decoder()?))
        } else {
            None
        };

        let mut entries = BTreeMap::new();
        for (task, datasets) in num_queries {
            let mut task_entries = BTreeMap::new();
            for (dataset, &queries) in datasets {
                let decoder = match &shared {
                    Some(decoder) => DecoderHandle::Shared(Arc::clone(decoder)),
                    None => DecoderHandle::Owned(build_decoder()?),
                };
                log::debug!(
                    "Registered decoder for {}/{} ({} queries, {})",
                    task,
                    dataset,
                    queries,
                    if share { "shared" } else { "independent" }
                );
                task_entries.insert(
                    dataset.clone(),
                    RegistryEntry {
                        decoder,
                        num_queries: queries,
                    },
                );
            }
            entries.insert(task.clone(), task_entries);
        }
        Ok(Self { entries, shared })
    }

    fn entry(&self, task: &str, dataset: &str) -> Result<&RegistryEntry> {
        self.entries
            .get(task)
            .and_then(|datasets| datasets.get(dataset))
            .ok_or_else(|| TransformerError::UnknownDecoder {
                task: task.to_string(),
                dataset: dataset.to_string(),
            })
    }

    /// Exact-match lookup; an unregistered pair is an error.
    pub fn get(&self, task: &str, dataset: &str) -> Result<&DecoderHandle> {
        Ok(&self.entry(task, dataset)?.decoder)
    }

    pub fn num_queries(&self, task: &str, dataset: &str) -> Result<usize> {
        Ok(self.entry(task, dataset)?.num_queries)
    }

    pub fn contains(&self, task: &str, dataset: &str) -> bool {
        self.entry(task, dataset).is_ok()
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered `(task, dataset, num_queries)` triples in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, usize)> + '_ {
        self.entries.iter().flat_map(|(task, datasets)| {
            datasets
                .iter()
                .map(move |(dataset, entry)| (task.as_str(), dataset.as_str(), entry.num_queries))
        })
    }

    /// Parameter count with the shared decoder counted once.
    pub fn num_parameters(&self) -> usize {
        match &self.shared {
            Some(decoder) => decoder.num_parameters(),
            None => self
                .entries
                .values()
                .flat_map(BTreeMap::values)
                .map(|entry| entry.decoder.num_parameters())
                .sum(),
        }
    }
}
