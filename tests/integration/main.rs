//! End-to-end tests driving the engine through scripted back ends.

mod mock_backend;
mod pipeline;
mod scanner;
