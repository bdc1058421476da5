pub mod dispatcher;
pub mod observer;
pub mod pipeline;
pub mod queue;
pub mod services;
pub mod store;
pub mod transport;
pub mod worker;
