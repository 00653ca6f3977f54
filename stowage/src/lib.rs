//! Core library for packaging application bundles into portable archives.
//! A bundle is a JSON manifest naming the container images an application
//! needs. Exporting writes the manifest, and optionally every image as an OCI
//! image layout, into a single gzip-compressed tarball; importing unpacks
//! such a tarball and can relocate its images to another registry.

/// Bundle manifests and how they are loaded from disk.
pub mod bundle;
/// Stores that make bundle images available, backed by registries or an OCI layout.
pub mod imagestore;
/// Types that model OCI image manifests, indexes and digests.
pub mod manifest;
/// Exporting bundles to archives and importing them back.
pub mod packager;
/// Parsing and relocating image references.
pub mod reference;
/// Clients for talking to OCI compatible registries.
pub mod registry;
