pub mod assemble;
pub mod cds;
pub mod compact;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod netcdf_reader;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod schema;
pub mod stac;
pub mod storage;
pub mod store;
pub mod transform;
