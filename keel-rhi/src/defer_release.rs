use parking_lot::Mutex;

use crate::backend::RenderBackend;

/// A native object waiting for the GPU to stop referencing it.
pub enum DeferredObject<B: RenderBackend> {
    Buffer(B::Buffer),
    Image(B::Image),
}

impl<B: RenderBackend> DeferredObject<B> {
    pub fn destroy(self, backend: &B) {
        match self {
            DeferredObject::Buffer(buffer) => backend.destroy_buffer(buffer),
            DeferredObject::Image(image) => backend.destroy_image(image),
        }
    }
}

/// Objects a ring slot frees right after its fence wait succeeds.
pub struct DeferReleaseQueue<B: RenderBackend> {
    objects: Mutex<Vec<DeferredObject<B>>>,
}

impl<B: RenderBackend> Default for DeferReleaseQueue<B> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
        }
    }
}

impl<B: RenderBackend> DeferReleaseQueue<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `object`; hands it back when the queue cannot grow.
    pub fn push(&self, object: DeferredObject<B>) -> Result<(), DeferredObject<B>> {
        let mut objects = self.objects.lock();
        if objects.try_reserve(1).is_err() {
            return Err(object);
        }
        objects.push(object);
        Ok(())
    }

    /// Destroy everything queued. Returns how many objects were freed.
    pub fn release_all(&self, backend: &B) -> usize {
        let objects = std::mem::take(&mut *self.objects.lock());
        let count = objects.len();
        for object in objects {
            object.destroy(backend);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn buffer_count(&self) -> usize {
        self.objects
            .lock()
            .iter()
            .filter(|object| matches!(object, DeferredObject::Buffer(_)))
            .count()
    }

    pub fn texture_count(&self) -> usize {
        self.objects
            .lock()
            .iter()
            .filter(|object| matches!(object, DeferredObject::Image(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use crate::resource::{BufferDesc, TextureDesc, TextureFormat};

    #[test]
    fn release_all_destroys_and_empties() {
        let backend = HeadlessBackend::new();
        let queue = DeferReleaseQueue::<HeadlessBackend>::new();

        let buffer = backend.create_buffer(&BufferDesc::vertex("a", 32)).unwrap();
        let image = backend
            .create_image(&TextureDesc::new_2d(2, 2, TextureFormat::Rgba8Unorm))
            .unwrap();
        assert!(queue.push(DeferredObject::Buffer(buffer)).is_ok());
        assert!(queue.push(DeferredObject::Image(image)).is_ok());
        assert_eq!(queue.buffer_count(), 1);
        assert_eq!(queue.texture_count(), 1);

        assert_eq!(queue.release_all(&backend), 2);
        assert!(queue.is_empty());
        assert_eq!(backend.freed_objects().len(), 2);
        assert_eq!(queue.release_all(&backend), 0);
    }
}
