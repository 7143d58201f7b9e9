use std::hash::Hash;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::engine::queue::TimeoutCheck;
use crate::error::DispatchError;
use crate::models::courier::Courier;
use crate::models::fulfillment::Fulfillment;
use crate::models::order::Order;
use crate::models::request::DeliveryRequest;
use crate::store::{AcceptanceFn, Mutation, Store};

/// DashMap-backed store. Per-record atomicity comes from holding the shard
/// write guard across the read-modify-write.
///
/// Lock order for multi-record operations: requests, orders, couriers,
/// fulfillments.
#[derive(Default)]
pub struct InMemoryStore {
    couriers: DashMap<Uuid, Courier>,
    orders: DashMap<Uuid, Order>,
    requests: DashMap<Uuid, DeliveryRequest>,
    fulfillments: DashMap<Uuid, Fulfillment>,
    timeout_checks: DashMap<(Uuid, u32), TimeoutCheck>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn guarded_update<K, T>(
    map: &DashMap<K, T>,
    key: K,
    kind: &str,
    mutate: Mutation<'_, T>,
) -> Result<T, DispatchError>
where
    K: Eq + Hash + std::fmt::Display,
    T: Clone,
{
    let mut entry = map
        .get_mut(&key)
        .ok_or_else(|| DispatchError::NotFound(format!("{kind} {key} not found")))?;

    let mut draft = entry.value().clone();
    mutate(&mut draft)?;
    *entry.value_mut() = draft.clone();

    Ok(draft)
}

fn insert_new<T>(map: &DashMap<Uuid, T>, id: Uuid, value: T, kind: &str) -> Result<(), DispatchError> {
    match map.entry(id) {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(DispatchError::InvalidState(format!(
            "{kind} {id} already exists"
        ))),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_courier(&self, courier: Courier) -> Result<(), DispatchError> {
        self.couriers.insert(courier.id, courier);
        Ok(())
    }

    async fn get_courier(&self, id: Uuid) -> Result<Option<Courier>, DispatchError> {
        Ok(self.couriers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_couriers(&self) -> Result<Vec<Courier>, DispatchError> {
        Ok(self
            .couriers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_courier(
        &self,
        id: Uuid,
        mutate: Mutation<'_, Courier>,
    ) -> Result<Courier, DispatchError> {
        guarded_update(&self.couriers, id, "courier", mutate)
    }

    async fn insert_order(&self, order: Order) -> Result<(), DispatchError> {
        insert_new(&self.orders, order.id, order, "order")
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, DispatchError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_orders(&self) -> Result<Vec<Order>, DispatchError> {
        Ok(self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_order(
        &self,
        id: Uuid,
        mutate: Mutation<'_, Order>,
    ) -> Result<Order, DispatchError> {
        guarded_update(&self.orders, id, "order", mutate)
    }

    async fn insert_request(&self, request: DeliveryRequest) -> Result<(), DispatchError> {
        insert_new(&self.requests, request.id, request, "delivery request")
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<DeliveryRequest>, DispatchError> {
        Ok(self.requests.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_requests(&self) -> Result<Vec<DeliveryRequest>, DispatchError> {
        Ok(self
            .requests
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_request(
        &self,
        id: Uuid,
        mutate: Mutation<'_, DeliveryRequest>,
    ) -> Result<DeliveryRequest, DispatchError> {
        guarded_update(&self.requests, id, "delivery request", mutate)
    }

    async fn get_fulfillment(&self, id: Uuid) -> Result<Option<Fulfillment>, DispatchError> {
        Ok(self.fulfillments.get(&id).map(|entry| entry.value().clone()))
    }

    async fn fulfillments_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<Fulfillment>, DispatchError> {
        Ok(self
            .fulfillments
            .iter()
            .filter(|entry| entry.value().order_id == order_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_fulfillment(
        &self,
        id: Uuid,
        mutate: Mutation<'_, Fulfillment>,
    ) -> Result<Fulfillment, DispatchError> {
        guarded_update(&self.fulfillments, id, "fulfillment", mutate)
    }

    async fn commit_acceptance(
        &self,
        request_id: Uuid,
        courier_id: Uuid,
        accept: AcceptanceFn<'_>,
    ) -> Result<Fulfillment, DispatchError> {
        let mut request_entry = self.requests.get_mut(&request_id).ok_or_else(|| {
            DispatchError::NotFound(format!("delivery request {request_id} not found"))
        })?;
        let order_id = request_entry.value().order_id;

        let mut order_entry = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id} not found")))?;
        let mut courier_entry = self
            .couriers
            .get_mut(&courier_id)
            .ok_or_else(|| DispatchError::NotFound(format!("courier {courier_id} not found")))?;

        let mut request = request_entry.value().clone();
        let mut order = order_entry.value().clone();
        let mut courier = courier_entry.value().clone();

        let fulfillment = accept(&mut request, &mut order, &mut courier)?;

        *request_entry.value_mut() = request;
        *order_entry.value_mut() = order;
        *courier_entry.value_mut() = courier;
        self.fulfillments.insert(fulfillment.id, fulfillment.clone());

        Ok(fulfillment)
    }

    async fn save_timeout_check(&self, check: TimeoutCheck) -> Result<(), DispatchError> {
        self.timeout_checks
            .insert((check.request_id, check.attempt), check);
        Ok(())
    }

    async fn remove_timeout_check(
        &self,
        request_id: Uuid,
        attempt: u32,
    ) -> Result<(), DispatchError> {
        self.timeout_checks.remove(&(request_id, attempt));
        Ok(())
    }

    async fn list_timeout_checks(&self) -> Result<Vec<TimeoutCheck>, DispatchError> {
        Ok(self
            .timeout_checks
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}
