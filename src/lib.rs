pub mod cleaner;
pub mod config;
pub mod denoise;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod grouper;
pub mod matcher;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod routes;
pub mod snapper;
pub mod streets;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
