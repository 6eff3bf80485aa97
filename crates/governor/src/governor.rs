use std::sync::Arc;

use datafusion::common::{DataFusionError, Result};
use datafusion::execution::disk_manager::{DiskManager, RefCountedTempFile};
use datafusion::execution::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use futures::future::BoxFuture;
use log::debug;

use crate::file_handles::{FileHandlePermit, FileHandleSemaphore};

/// Process-wide resource services handed to every window operator.
///
/// The memory pool, the disk manager and the file handle semaphore are
/// shared by all operators built from clones of the same governor, so an
/// operator can be denied memory or handles because of its siblings.
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    memory_pool: Arc<dyn MemoryPool>,
    disk_manager: Arc<DiskManager>,
    file_handles: Arc<FileHandleSemaphore>,
}

impl ResourceGovernor {
    pub fn new(
        memory_pool: Arc<dyn MemoryPool>,
        disk_manager: Arc<DiskManager>,
        file_handles: FileHandleSemaphore,
    ) -> Self {
        Self {
            memory_pool,
            disk_manager,
            file_handles: Arc::new(file_handles),
        }
    }

    pub fn memory_pool(&self) -> &Arc<dyn MemoryPool> {
        &self.memory_pool
    }

    /// Bytes currently reserved against the shared memory pool.
    pub fn reserved_memory(&self) -> usize {
        self.memory_pool.reserved()
    }

    /// Registers a spillable consumer; the returned reservation starts empty
    /// and frees whatever it still holds when dropped.
    pub fn register_consumer(&self, name: impl Into<String>) -> MemoryReservation {
        MemoryConsumer::new(name)
            .with_can_spill(true)
            .register(&self.memory_pool)
    }

    /// Creates a fresh temp file for a spill queue. The file is deleted once
    /// the last handle to it is dropped.
    pub fn create_spill_file(&self, description: &str) -> Result<RefCountedTempFile> {
        let file = self.disk_manager.create_tmp_file(description).map_err(|e| {
            DataFusionError::ResourcesExhausted(format!(
                "failed to create spill file for {description}: {e}"
            ))
        })?;
        debug!("created spill file {:?} for {description}", file.path());
        Ok(file)
    }

    pub fn file_handles(&self) -> &FileHandleSemaphore {
        &self.file_handles
    }

    pub fn max_file_handles(&self) -> usize {
        self.file_handles.capacity()
    }

    pub fn held_file_handles(&self) -> usize {
        self.file_handles.held()
    }

    pub fn acquire_file_handles(&self, count: usize) -> BoxFuture<'static, Result<FileHandlePermit>> {
        self.file_handles.acquire(count)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use datafusion::execution::disk_manager::DiskManagerConfig;
    use datafusion::execution::memory_pool::GreedyMemoryPool;

    use super::*;

    fn governor(limit: usize, disk: DiskManagerConfig) -> ResourceGovernor {
        ResourceGovernor::new(
            Arc::new(GreedyMemoryPool::new(limit)),
            DiskManager::try_new(disk).unwrap(),
            FileHandleSemaphore::new(8),
        )
    }

    #[test]
    fn reservations_are_accounted_and_released() {
        let governor = governor(100, DiskManagerConfig::Disabled);
        let mut reservation = governor.register_consumer("test");
        reservation.try_grow(60).unwrap();
        assert_eq!(governor.reserved_memory(), 60);

        let mut sibling = governor.register_consumer("sibling");
        assert!(sibling.try_grow(60).is_err());
        sibling.try_grow(40).unwrap();

        drop(reservation);
        drop(sibling);
        assert_eq!(governor.reserved_memory(), 0);
    }

    #[test]
    fn disabled_disk_manager_is_resource_exhaustion() {
        let governor = governor(100, DiskManagerConfig::Disabled);
        let err = governor.create_spill_file("test spill").unwrap_err();
        assert!(matches!(err, DataFusionError::ResourcesExhausted(_)));
    }

    #[test]
    fn spill_files_are_deleted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let governor = governor(
            100,
            DiskManagerConfig::NewSpecified(vec![dir.path().to_path_buf()]),
        );
        let file = governor.create_spill_file("test spill").unwrap();
        let path = file.path().to_path_buf();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"spilled")
            .unwrap();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn clones_share_the_file_handle_semaphore() {
        let governor = governor(100, DiskManagerConfig::Disabled);
        let sibling = governor.clone();
        let permit = governor.acquire_file_handles(5).await.unwrap();
        assert_eq!(sibling.held_file_handles(), 5);
        drop(permit);
        assert_eq!(sibling.held_file_handles(), 0);
    }
}
