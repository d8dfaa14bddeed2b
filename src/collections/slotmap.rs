/// Dense storage with stable indices, reusing released slots through a free list.
#[derive(Debug)]
pub struct SlotMap<T> {
    head: u32,
    len: usize,
    entries: Vec<Result<T, u32>>,
}
impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<T> SlotMap<T> {
    pub fn new() -> Self {
        Self {
            head: u32::MAX,
            len: 0,
            entries: vec![],
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn get(&self, i: usize) -> Option<&T> {
        self.entries.get(i).and_then(|r| r.as_ref().ok())
    }
    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        self.entries.get_mut(i).and_then(|r| r.as_mut().ok())
    }
    pub fn insert(&mut self, value: T) -> usize {
        self.len += 1;
        if self.head == u32::MAX {
            self.entries.push(Ok(value));
            return self.entries.len() - 1;
        }
        let id = self.head as usize;
        match core::mem::replace(&mut self.entries[id], Ok(value)) {
            Err(next) => self.head = next,
            Ok(_) => unreachable!("free list points at a live slot"),
        }
        id
    }
    pub fn release(&mut self, i: usize) -> Option<T> {
        let slot = self.entries.get_mut(i)?;
        if slot.is_err() {
            return None;
        }
        let value = core::mem::replace(slot, Err(self.head)).ok();
        self.head = i as u32;
        self.len -= 1;
        value
    }
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().ok().map(|v| (i, v)))
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, v)| v.as_mut().ok().map(|v| (i, v)))
    }
    pub fn retain(&mut self, mut f: impl FnMut(usize, &mut T) -> bool) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if let Ok(item) = entry {
                if !f(i, item) {
                    *entry = Err(core::mem::replace(&mut self.head, i as u32));
                    self.len -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused() {
        let mut map = SlotMap::new();
        let a = map.insert("a");
        let b = map.insert("b");
        assert_eq!(map.release(a), Some("a"));
        assert_eq!(map.release(a), None);
        let c = map.insert("c");
        assert_eq!(c, a);
        assert_eq!(map.get(b), Some(&"b"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn retain_feeds_the_free_list() {
        let mut map = SlotMap::new();
        for i in 0..5 {
            map.insert(i);
        }
        map.retain(|_, v| *v % 2 == 0);
        assert_eq!(map.len(), 3);
        assert_eq!(map.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![0, 2, 4]);
        let reused = map.insert(9);
        assert!(reused == 1 || reused == 3);
    }
}
