use anyhow::Result;
use async_trait::async_trait;
use pkg_client::SharedCollectionFs;
use pkg_constants::keep::BLOCK_SIZE;

/// Destination for flushed log text.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Appends to one file of the run's log collection. Full blocks are uploaded
/// as soon as they fill so memory stays bounded on chatty containers.
pub struct CollectionFile {
    fs: SharedCollectionFs,
    path: String,
}

impl CollectionFile {
    pub async fn create(fs: SharedCollectionFs, path: &str) -> Result<Self> {
        fs.lock().await.create(path)?;
        Ok(Self {
            fs,
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl LogSink for CollectionFile {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut fs = self.fs.lock().await;
        fs.append(&self.path, data)?;
        if fs.unflushed() >= BLOCK_SIZE {
            fs.flush(true).await?;
        }
        Ok(())
    }
}
