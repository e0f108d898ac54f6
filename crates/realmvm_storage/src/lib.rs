//! Object persistence for realmvm.
//!
//! This crate provides:
//! - [`Store`] - The transactional store interface used by realms and the machine
//! - [`CacheStore`] - Per-transaction identity cache and write buffer
//! - [`Backend`] / [`MemBackend`] - Durable key/value storage
//! - [`ObjectImage`] - Serializable object images and content hashing
//! - [`FuncRegistry`] - Location-indexed function declarations

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod cache;
pub mod image;
pub mod registry;
pub mod store;

pub use backend::{Backend, MemBackend, WriteBatch};
pub use cache::CacheStore;
pub use image::{
    FuncImage, ImageLoader, InfoImage, NativeImage, ObjectImage, RefImage, TypeSink,
    TypedValueImage, ValueImage, encode_object, fill_object, internalize_type, shell_object,
};
pub use registry::FuncRegistry;
pub use store::{RealmRecord, Store};
