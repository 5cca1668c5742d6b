// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! HTTP live-preview server for Glance scenes.
//!
//! Serves the scene held by a [`glance_scene::SceneRegistry`] to browser
//! viewers: a server-sent-event update feed, per-object GLB downloads and a
//! whole-scene GLBS export. [`Server::stop`] drains viewers and in-flight
//! requests before closing the listener.

mod engine;
mod routes;
mod server;
mod settings;
mod shutdown;
mod state;

pub use engine::NoGeometryEngine;
pub use routes::router;
pub use server::{Server, ServerError};
pub use settings::{Settings, SettingsArgs, SettingsError, CONFIG_KEY};
pub use shutdown::wait_for_shutdown_signal;
pub use state::AppState;
