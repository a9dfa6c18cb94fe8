//! Unit tests mirroring the `src/` tree, one file per source module

mod model;
mod pipeline;
mod spatial;
mod voting;
