//! In-process mock venue servers and a reference venue adapter, used by the
//! integration tests across the workspace.

mod rest;
mod venue;
mod websocket;

pub use rest::MockSnapshotApi;
pub use venue::ReferenceVenue;
pub use websocket::{MockVenueConfig, MockVenueServer};
