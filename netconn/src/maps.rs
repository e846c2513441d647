use aya::{
    maps::{HashMap, MapData},
    Pod,
};

use crate::error::Error;

pub trait KernelMap<K, V> {
    fn lookup(&self, key: &K) -> Result<Option<V>, Error>;

    fn update(&mut self, key: &K, value: &V) -> Result<(), Error>;

    /// A missing key is reported as [`Error::NotFound`].
    fn delete(&mut self, key: &K) -> Result<(), Error>;

    // the kernel keeps writing while we iterate
    fn entries(&self) -> Box<dyn Iterator<Item = Result<(K, V), Error>> + '_>;
}

impl<K: Pod, V: Pod> KernelMap<K, V> for HashMap<MapData, K, V> {
    fn lookup(&self, key: &K) -> Result<Option<V>, Error> {
        match self.get(key, 0).map_err(Error::from) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn update(&mut self, key: &K, value: &V) -> Result<(), Error> {
        self.insert(key, value, 0)?;
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<(), Error> {
        self.remove(key)?;
        Ok(())
    }

    fn entries(&self) -> Box<dyn Iterator<Item = Result<(K, V), Error>> + '_> {
        Box::new(self.iter().map(|item| item.map_err(Error::from)))
    }
}

#[cfg(test)]
pub use memory::MemoryMap;
