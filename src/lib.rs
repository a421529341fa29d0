pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod fs_util;
pub mod geonode;
pub mod http;
pub mod normalize;
pub mod output;
pub mod reconcile;
pub mod token;
pub mod wikidata;
