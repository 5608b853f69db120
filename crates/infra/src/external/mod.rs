//! External service clients/adapters.
//!
//! The worker only sees these traits. Production adapters shell out to a
//! headless browser, write to a storage root and POST webhooks with
//! `reqwest`; the scripted/in-memory variants back the tests.

pub mod rasterizer;
pub mod storage;
pub mod webhook;

pub use rasterizer::{
    ChromiumRasterizer, Rasterizer, RasterizerError, RenderSession, SCRIPTED_PDF, ScriptedRasterizer,
    ScriptedRender,
};
pub use storage::{InMemoryObjectStorage, LocalObjectStorage, ObjectStorage, StorageError, StorageFault};
pub use webhook::{
    HttpWebhookNotifier, RecordingWebhookNotifier, WebhookError, WebhookEvent, WebhookNotifier,
};
