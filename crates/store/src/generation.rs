//! Published model generations
//!
//! A [`Generation`] is everything a reader needs to answer a request: user
//! rows, item rows, the global model and the ANN index built over exactly
//! the generation's items. The set of users and items in a generation is
//! fixed for items and append-only for users; row *values* live in
//! `ArcSwap` cells so online updates can replace a vector and its bias in
//! one atomic store without copying the generation.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use latent_core::{
    Factor, GenerationId, GlobalModel, ItemFactor, ItemId, LatentError, LatentResult, UserFactor,
    UserId,
};
use latent_index::{DistanceMetric, HnswConfig, HnswIndex, NodeId, VectorTable};
use rustc_hash::FxHashMap;

/// Inputs for a batch publish
#[derive(Debug, Clone)]
pub struct NewGeneration {
    /// All user rows of the new model
    pub users: Vec<UserFactor>,
    /// All item rows, in the index's `NodeId` order
    pub items: Vec<ItemFactor>,
    /// Global mean and completion time of the batch run
    pub global: GlobalModel,
    /// Index built over `items`
    pub index: Arc<HnswIndex>,
}

/// One item row, addressed by the index's NodeId
#[derive(Debug)]
pub struct ItemRow {
    id: ItemId,
    factor: ArcSwap<Factor>,
}

impl ItemRow {
    /// Item identifier
    pub fn id(&self) -> &ItemId {
        &self.id
    }

    /// Current vector and bias
    pub fn factor(&self) -> Arc<Factor> {
        self.factor.load_full()
    }
}

/// An immutable-membership model generation
#[derive(Debug)]
pub struct Generation {
    id: GenerationId,
    dimension: usize,
    global: GlobalModel,
    index: Arc<HnswIndex>,
    items: Vec<ItemRow>,
    item_nodes: FxHashMap<ItemId, NodeId>,
    users: DashMap<UserId, ArcSwap<Factor>>,
}

impl Generation {
    /// The empty generation a fresh store starts with
    pub(crate) fn empty(dimension: usize) -> LatentResult<Self> {
        let table = VectorTable::new(dimension)?;
        let index = HnswIndex::build(table, DistanceMetric::InnerProduct, HnswConfig::default())?;
        Ok(Self {
            id: GenerationId::INITIAL,
            dimension,
            global: GlobalModel::empty(),
            index: Arc::new(index),
            items: Vec::new(),
            item_nodes: FxHashMap::default(),
            users: DashMap::new(),
        })
    }

    /// Validate a batch result and turn it into a generation.
    ///
    /// Rejects dimension disagreements, non-finite rows, duplicate ids and
    /// any difference between the item table and the index contents.
    pub(crate) fn assemble(
        id: GenerationId,
        dimension: usize,
        new: NewGeneration,
    ) -> LatentResult<Self> {
        let NewGeneration {
            users,
            items,
            global,
            index,
        } = new;

        if !global.global_mean.is_finite() {
            return Err(LatentError::invalid_input("global mean is not finite"));
        }
        if index.dimension() != dimension {
            return Err(LatentError::dimension_mismatch(dimension, index.dimension()));
        }
        if index.len() != items.len() {
            return Err(LatentError::invalid_input(format!(
                "index holds {} items but item table has {}",
                index.len(),
                items.len()
            )));
        }

        let mut item_nodes = FxHashMap::default();
        item_nodes.reserve(items.len());
        let mut rows = Vec::with_capacity(items.len());
        for (pos, item) in items.into_iter().enumerate() {
            item.factor.check_dimension(dimension)?;
            if !item.factor.is_finite() {
                return Err(LatentError::invalid_input(format!(
                    "item {} has non-finite factors",
                    item.id
                )));
            }
            let node = NodeId::new(pos as u32);
            if index.vector(node) != Some(item.factor.vector.as_slice()) {
                return Err(LatentError::invalid_input(format!(
                    "index vector for item {} differs from the item table",
                    item.id
                )));
            }
            if item_nodes.insert(item.id.clone(), node).is_some() {
                return Err(LatentError::invalid_input(format!(
                    "duplicate item id {}",
                    item.id
                )));
            }
            rows.push(ItemRow {
                id: item.id,
                factor: ArcSwap::from_pointee(item.factor),
            });
        }

        let user_map = DashMap::with_capacity(users.len());
        for user in users {
            user.factor.check_dimension(dimension)?;
            if !user.factor.is_finite() {
                return Err(LatentError::invalid_input(format!(
                    "user {} has non-finite factors",
                    user.id
                )));
            }
            if user_map
                .insert(user.id.clone(), ArcSwap::from_pointee(user.factor))
                .is_some()
            {
                return Err(LatentError::invalid_input(format!(
                    "duplicate user id {}",
                    user.id
                )));
            }
        }

        Ok(Self {
            id,
            dimension,
            global,
            index,
            items: rows,
            item_nodes,
            users: user_map,
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Generation identifier
    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// Common vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Global mean and completion time
    pub fn global(&self) -> &GlobalModel {
        &self.global
    }

    /// ANN index over exactly this generation's items
    pub fn index(&self) -> &Arc<HnswIndex> {
        &self.index
    }

    /// Number of items
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Number of users
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Current factor of a user
    pub fn user(&self, id: &UserId) -> Option<Arc<Factor>> {
        self.users.get(id).map(|cell| cell.load_full())
    }

    /// Current factor of an item
    pub fn item(&self, id: &ItemId) -> Option<Arc<Factor>> {
        self.item_node(id)
            .and_then(|node| self.items.get(node.as_usize()))
            .map(ItemRow::factor)
    }

    /// Row of the item an index hit refers to
    pub fn item_at(&self, node: NodeId) -> Option<&ItemRow> {
        self.items.get(node.as_usize())
    }

    /// Index node of an item
    pub fn item_node(&self, id: &ItemId) -> Option<NodeId> {
        self.item_nodes.get(id).copied()
    }

    /// All item rows in NodeId order
    pub fn items(&self) -> &[ItemRow] {
        &self.items
    }

    /// Copy of every user row, sorted by id
    pub fn user_rows(&self) -> Vec<UserFactor> {
        let mut rows: Vec<UserFactor> = self
            .users
            .iter()
            .map(|entry| UserFactor {
                id: entry.key().clone(),
                factor: Factor::clone(&entry.value().load()),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Copy of every item row in NodeId order
    pub fn item_rows(&self) -> Vec<ItemFactor> {
        self.items
            .iter()
            .map(|row| ItemFactor {
                id: row.id.clone(),
                factor: Factor::clone(&row.factor.load()),
            })
            .collect()
    }

    // ========================================================================
    // Row replacement (callers hold the row's key lock)
    // ========================================================================

    pub(crate) fn store_user(&self, id: &UserId, factor: Factor) {
        match self.users.get(id) {
            Some(cell) => cell.store(Arc::new(factor)),
            None => {
                self.users
                    .entry(id.clone())
                    .or_insert_with(|| ArcSwap::from_pointee(Factor::zeros(self.dimension)))
                    .store(Arc::new(factor));
            }
        }
    }

    /// Returns false if the item is not part of this generation
    pub(crate) fn store_item(&self, id: &ItemId, factor: Factor) -> bool {
        match self.item_node(id).and_then(|node| self.items.get(node.as_usize())) {
            Some(row) => {
                row.factor.store(Arc::new(factor));
                true
            }
            None => false,
        }
    }
}
