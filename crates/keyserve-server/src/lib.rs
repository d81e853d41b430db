#![doc = include_str!("../README.md")]

pub mod server;

pub use server::{
    config::{CliArgs, IssuerConfig, ServerConfig, Settings},
    generator::{CredentialGenerator, IssuerGenerator, KeyAlgorithm},
    registry::{Join, Registry, Status},
    service::handler::{KeyService, ServerHandle},
};
