//! Bounded arena of connections.
//!
//! Slots are reused through a free list. Each slot carries a generation
//! that is bumped on removal, so a [`ConnectionId`] kept after `destroy`
//! no longer resolves.

use std::fmt;

/// Handle to a connection in an [`IoContext`](crate::IoContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    item: Option<T>,
}

/// Fixed-capacity, generation-checked storage.
#[derive(Debug)]
pub(crate) struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    capacity: usize,
}

impl<T> Registry<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Store `item`, or hand it back when the registry is full.
    pub(crate) fn insert(&mut self, item: T) -> Result<ConnectionId, T> {
        if self.is_full() {
            return Err(item);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let Ok(index) = u32::try_from(self.slots.len()) else {
                    return Err(item);
                };
                self.slots.push(Slot {
                    generation: 0,
                    item: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.item = Some(item);
        self.len += 1;

        Ok(ConnectionId {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.item.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.item.as_mut())
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let item = slot.item.take()?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(item)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ConnectionId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let item = slot.item.as_ref()?;
            Some((
                ConnectionId {
                    index: index as u32,
                    generation: slot.generation,
                },
                item,
            ))
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.item.as_mut())
    }

    /// Remove every item.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(item) = slot.item.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                items.push(item);
            }
        }
        self.len = 0;
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut reg = Registry::new(2);
        let a = reg.insert("libera").unwrap();
        let b = reg.insert("oftc").unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.is_full());
        assert_eq!(reg.insert("efnet"), Err("efnet"));

        assert_eq!(reg.get(a), Some(&"libera"));
        *reg.get_mut(b).unwrap() = "oftc.net";
        assert_eq!(reg.remove(b), Some("oftc.net"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(b), None);
    }

    #[test]
    fn stale_id_does_not_alias_reused_slot() {
        let mut reg = Registry::new(1);
        let old = reg.insert(1).unwrap();
        reg.remove(old);
        let new = reg.insert(2).unwrap();

        assert_ne!(old, new);
        assert_eq!(reg.get(old), None);
        assert_eq!(reg.remove(old), None);
        assert_eq!(reg.get(new), Some(&2));
    }

    #[test]
    fn iteration_skips_empty_slots() {
        let mut reg = Registry::new(4);
        let ids: Vec<_> = (0..4).map(|n| reg.insert(n).unwrap()).collect();
        reg.remove(ids[1]);
        reg.remove(ids[2]);

        let live: Vec<_> = reg.iter().map(|(id, v)| (id, *v)).collect();
        assert_eq!(live, vec![(ids[0], 0), (ids[3], 3)]);

        for v in reg.iter_mut() {
            *v += 10;
        }
        assert_eq!(reg.drain(), vec![10, 13]);
        assert_eq!(reg.len(), 0);
        assert_eq!(reg.get(ids[0]), None);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let mut reg: Registry<u8> = Registry::new(0);
        assert!(reg.insert(1).is_err());
    }
}
