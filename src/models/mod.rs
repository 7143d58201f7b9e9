pub mod cancellation;
pub mod courier;
pub mod fulfillment;
pub mod notification;
pub mod order;
pub mod request;
