pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::queue::TimeoutCheck;
use crate::error::DispatchError;
use crate::models::courier::Courier;
use crate::models::fulfillment::Fulfillment;
use crate::models::order::Order;
use crate::models::request::DeliveryRequest;

pub use memory::InMemoryStore;

/// Guarded read-modify-write. Returning `Err` leaves the record untouched,
/// so the closure doubles as the update filter.
pub type Mutation<'a, T> = Box<dyn FnOnce(&mut T) -> Result<(), DispatchError> + Send + 'a>;

/// Applied to the request, its order and the accepting courier under a single
/// lock scope. Produces the fulfillment to persist.
pub type AcceptanceFn<'a> = Box<
    dyn FnOnce(&mut DeliveryRequest, &mut Order, &mut Courier) -> Result<Fulfillment, DispatchError>
        + Send
        + 'a,
>;

/// Document store the dispatch engine runs against.
///
/// Each `update_*` is atomic per record: concurrent updates on the same id are
/// serialized and each sees the previous one's result.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_courier(&self, courier: Courier) -> Result<(), DispatchError>;
    async fn get_courier(&self, id: Uuid) -> Result<Option<Courier>, DispatchError>;
    async fn list_couriers(&self) -> Result<Vec<Courier>, DispatchError>;
    async fn update_courier(
        &self,
        id: Uuid,
        mutate: Mutation<'_, Courier>,
    ) -> Result<Courier, DispatchError>;

    async fn insert_order(&self, order: Order) -> Result<(), DispatchError>;
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, DispatchError>;
    async fn list_orders(&self) -> Result<Vec<Order>, DispatchError>;
    async fn update_order(
        &self,
        id: Uuid,
        mutate: Mutation<'_, Order>,
    ) -> Result<Order, DispatchError>;

    async fn insert_request(&self, request: DeliveryRequest) -> Result<(), DispatchError>;
    async fn get_request(&self, id: Uuid) -> Result<Option<DeliveryRequest>, DispatchError>;
    async fn list_requests(&self) -> Result<Vec<DeliveryRequest>, DispatchError>;
    async fn update_request(
        &self,
        id: Uuid,
        mutate: Mutation<'_, DeliveryRequest>,
    ) -> Result<DeliveryRequest, DispatchError>;

    async fn get_fulfillment(&self, id: Uuid) -> Result<Option<Fulfillment>, DispatchError>;
    async fn fulfillments_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<Fulfillment>, DispatchError>;
    async fn update_fulfillment(
        &self,
        id: Uuid,
        mutate: Mutation<'_, Fulfillment>,
    ) -> Result<Fulfillment, DispatchError>;

    /// Indivisible `pending -> accepted` transition: request, order and
    /// courier are updated and the fulfillment inserted together, or nothing
    /// changes.
    async fn commit_acceptance(
        &self,
        request_id: Uuid,
        courier_id: Uuid,
        accept: AcceptanceFn<'_>,
    ) -> Result<Fulfillment, DispatchError>;

    async fn save_timeout_check(&self, check: TimeoutCheck) -> Result<(), DispatchError>;
    async fn remove_timeout_check(
        &self,
        request_id: Uuid,
        attempt: u32,
    ) -> Result<(), DispatchError>;
    async fn list_timeout_checks(&self) -> Result<Vec<TimeoutCheck>, DispatchError>;
}
