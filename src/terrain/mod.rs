//! Terrain level-of-detail streaming.
//!
//! A [`TerrainNode`] keeps concentric rings of terrain geometry around every
//! camera that renders it. Rings request heightmap tiles from a
//! [`HeightSampler`], which loads the backing images lazily through a
//! [`HeightmapSource`]. Geometry reaches the GPU through a
//! [`GeometryBackend`].
pub mod backend;
pub mod config;
pub mod error;
pub mod geometry;
pub mod images;
pub mod index_cache;
pub mod json;
pub mod material;
pub mod node;
pub mod ring;
pub mod sampler;
pub mod worker;

pub use backend::{
    Aabb, BufferUsage, GeometryBackend, IndexBufferHandle, TerrainVertex, VertexBufferHandle,
};
pub use config::TerrainSettings;
pub use error::{Error, Result};
pub use images::{
    FetchRequest, FetchResult, FetchSender, HeightImage, HeightmapSource, ImageFileSource,
    TextureFlags,
};
pub use index_cache::{IndexBuffer, IndexKey, TileCache};
pub use json::{load_description, MapEntry, MaterialEntry, TerrainDescription};
pub use material::{Material, MaterialFlags, Pass, PassState, ShaderConstant};
pub use node::{CameraId, TerrainCamera, TerrainEntity, TerrainNode, Visibility};
pub use ring::{RingId, RingSet, RingState, RingTicket, TerrainMesh, TerrainRing};
pub use sampler::{
    HeightSampler, LodRequest, LodResolution, TileArrival, TileDescriptor, TileRect,
    VertexFetchParams,
};
pub use worker::{Dispatched, Job, JobOutput, WorkerDispatch};
