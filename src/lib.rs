// src/lib.rs

// On déclare les modules principaux pour les rendre utilisables par le
// binaire `poolwatch` et par les tests d'intégration.
pub mod config;
pub mod detection;
pub mod monitoring;
pub mod rpc;
