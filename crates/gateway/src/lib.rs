pub mod adapters;
pub mod compressor;
pub mod forward;
pub mod phantom;
pub mod pipes;
pub mod pricing;
pub mod rate_limit;
pub mod router;
pub mod sessions;
pub mod shadow;
pub mod streaming;
pub mod telemetry;
