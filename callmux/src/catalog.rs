//! Catalog collaborator and the food price services built on the engine.
//!
//! The catalog answers two questions: which vendors carry an item, and what a
//! vendor charges for it. [`PriceService`] and [`SupplierService`] serve those
//! answers behind a [`Multiplexer`](crate::Multiplexer);
//! [`PriceFinder`] asks the supplier service for the vendors carrying an item,
//! then asks all of them at once through a [`FanOut`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, EngineError};
use crate::fanout::{FanOut, PeerOutcome};
use crate::peer::PeerId;
use crate::providers::{TimeProvider, TokioTimeProvider};
use crate::service::Service;
use crate::substrate::OutboundSubstrate;

/// Source of vendor listings and prices.
pub trait Catalog: Send + Sync + 'static {
    /// Vendors carrying `item`.
    fn list_peers(&self, item: &str) -> BTreeSet<PeerId>;

    /// Price `peer` charges for `item`, None when it does not carry it.
    fn resolve(&self, peer: &PeerId, item: &str) -> Option<f64>;
}

/// Catalog held in memory: vendor -> item -> price.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    inventory: BTreeMap<PeerId, BTreeMap<String, f64>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update the price of `item` at `vendor`.
    pub fn insert(&mut self, vendor: impl Into<PeerId>, item: impl Into<String>, price: f64) {
        self.inventory
            .entry(vendor.into())
            .or_default()
            .insert(item.into(), price);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_item(
        mut self,
        vendor: impl Into<PeerId>,
        item: impl Into<String>,
        price: f64,
    ) -> Self {
        self.insert(vendor, item, price);
        self
    }

    /// Every vendor known to the catalog.
    pub fn vendors(&self) -> impl Iterator<Item = &PeerId> {
        self.inventory.keys()
    }
}

impl Catalog for InMemoryCatalog {
    fn list_peers(&self, item: &str) -> BTreeSet<PeerId> {
        self.inventory
            .iter()
            .filter(|(_, items)| items.contains_key(item))
            .map(|(vendor, _)| vendor.clone())
            .collect()
    }

    fn resolve(&self, peer: &PeerId, item: &str) -> Option<f64> {
        self.inventory.get(peer)?.get(item).copied()
    }
}

/// Ask one vendor for the price of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRequest {
    /// Vendor being asked.
    pub vendor: PeerId,
    /// Item name.
    pub item: String,
}

/// A vendor's price for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Vendor quoting.
    pub vendor: PeerId,
    /// Item name.
    pub item: String,
    /// Quoted price.
    pub price: f64,
}

/// Ask which vendors carry an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierRequest {
    /// Item name.
    pub item: String,
}

/// Vendors carrying an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierList {
    /// Item name.
    pub item: String,
    /// Vendors, sorted.
    pub suppliers: Vec<PeerId>,
}

/// Answers [`PriceRequest`]s from a catalog.
pub struct PriceService<C> {
    catalog: Arc<C>,
}

impl<C: Catalog> PriceService<C> {
    /// Serve prices from `catalog`.
    pub fn new(catalog: Arc<C>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl<C: Catalog> Service for PriceService<C> {
    type Request = PriceRequest;
    type Response = PriceQuote;

    async fn call(&self, request: &PriceRequest) -> Result<PriceQuote, CallError> {
        let price = self
            .catalog
            .resolve(&request.vendor, &request.item)
            .ok_or(CallError::NotFound)?;
        Ok(PriceQuote {
            vendor: request.vendor.clone(),
            item: request.item.clone(),
            price,
        })
    }
}

/// Answers [`SupplierRequest`]s from a catalog.
pub struct SupplierService<C> {
    catalog: Arc<C>,
}

impl<C: Catalog> SupplierService<C> {
    /// Serve supplier lists from `catalog`.
    pub fn new(catalog: Arc<C>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl<C: Catalog> Service for SupplierService<C> {
    type Request = SupplierRequest;
    type Response = SupplierList;

    async fn call(&self, request: &SupplierRequest) -> Result<SupplierList, CallError> {
        Ok(SupplierList {
            item: request.item.clone(),
            suppliers: self.catalog.list_peers(&request.item).into_iter().collect(),
        })
    }
}

/// Collects prices for an item from many vendors at once.
///
/// [`lookup`](Self::lookup) runs the whole flow: ask the supplier service
/// which vendors carry the item, then ask all of them for a price.
pub struct PriceFinder<V, D, T = TokioTimeProvider> {
    supplier: PeerId,
    directory: FanOut<D, T>,
    vendors: FanOut<V, T>,
}

impl<V, D, T> PriceFinder<V, D, T>
where
    V: OutboundSubstrate<Request = PriceRequest, Response = PriceQuote>,
    D: OutboundSubstrate<Request = SupplierRequest, Response = SupplierList>,
    T: TimeProvider,
{
    /// Ask `supplier` through `directory` for listings and vendors through
    /// `vendors` for prices.
    pub fn new(supplier: PeerId, directory: FanOut<D, T>, vendors: FanOut<V, T>) -> Self {
        Self {
            supplier,
            directory,
            vendors,
        }
    }

    /// The dispatcher used for price calls.
    pub fn fan_out(&self) -> &FanOut<V, T> {
        &self.vendors
    }

    /// The supplier service asked for listings.
    pub fn supplier(&self) -> &PeerId {
        &self.supplier
    }

    /// Ask the supplier service which vendors carry `item`.
    ///
    /// The inner error is the supplier call's own failure.
    pub async fn suppliers(
        &self,
        item: &str,
    ) -> Result<Result<Vec<PeerId>, CallError>, EngineError> {
        let request = SupplierRequest {
            item: item.to_string(),
        };
        let mut lists = self
            .directory
            .dispatch_shared([self.supplier.clone()], &request)
            .await?;
        let listed = lists
            .remove(&self.supplier)
            .map_or(Err(CallError::Unavailable), PeerOutcome::into_result);
        Ok(listed.map(|list| list.suppliers))
    }

    /// Ask each of `vendors` for the price of `item`.
    ///
    /// A vendor that fails or does not carry the item gets a
    /// [`PeerOutcome::Failed`] entry; the others are unaffected.
    pub async fn find_prices<I>(
        &self,
        item: &str,
        vendors: I,
    ) -> Result<HashMap<PeerId, PeerOutcome<PriceQuote>>, EngineError>
    where
        I: IntoIterator<Item = PeerId>,
    {
        self.vendors
            .dispatch(vendors, |vendor| PriceRequest {
                vendor: vendor.clone(),
                item: item.to_string(),
            })
            .await
    }

    /// Prices for `item` from every vendor the supplier service lists.
    ///
    /// A failed supplier call is logged and yields no quotes, the same as an
    /// item nobody carries.
    pub async fn lookup(
        &self,
        item: &str,
    ) -> Result<HashMap<PeerId, PeerOutcome<PriceQuote>>, EngineError> {
        let vendors = match self.suppliers(item).await? {
            Ok(vendors) => vendors,
            Err(error) => {
                tracing::warn!(item, supplier = %self.supplier, %error, "supplier lookup failed");
                return Ok(HashMap::new());
            }
        };
        if vendors.is_empty() {
            tracing::info!(item, "no vendor carries item");
        }
        self.find_prices(item, vendors).await
    }

    /// Prices for `item` from every vendor a local `catalog` lists, skipping
    /// the supplier service.
    pub async fn lookup_in<C>(
        &self,
        catalog: &C,
        item: &str,
    ) -> Result<HashMap<PeerId, PeerOutcome<PriceQuote>>, EngineError>
    where
        C: Catalog + ?Sized,
    {
        self.find_prices(item, catalog.list_peers(item)).await
    }
}
