/// Entry of a sparse matrix
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triplet {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// Append-only buffer of sparse Jacobian entries
///
/// Rows are global parameter indices. Columns are whitened residual rows, allocated on the fly
/// with [TripletList::allocate_columns] so that every term gets its own disjoint column range.
#[derive(Clone, Debug, Default)]
pub struct TripletList {
    triplets: Vec<Triplet>,
    next_free_index: usize,
}

impl TripletList {
    /// `capacity` is a hint only, the buffer grows as needed
    pub fn new(capacity: usize) -> Self {
        Self {
            triplets: Vec::with_capacity(capacity),
            next_free_index: 0,
        }
    }

    #[inline]
    pub fn add_triplet(&mut self, row: usize, col: usize, value: f64) {
        self.triplets.push(Triplet { row, col, value });
    }

    /// Number of columns allocated so far
    #[inline]
    pub fn next_free_index(&self) -> usize {
        self.next_free_index
    }

    /// Reserves `n` fresh columns and returns the first of them
    pub fn allocate_columns(&mut self, n: usize) -> usize {
        let first = self.next_free_index;
        self.next_free_index += n;
        first
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }

    /// Drops the entries and resets the column allocator
    pub fn clear(&mut self) {
        self.triplets.clear();
        self.next_free_index = 0;
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Triplet> {
        self.triplets.iter()
    }

    pub fn as_slice(&self) -> &[Triplet] {
        &self.triplets
    }
}

impl<'a> IntoIterator for &'a TripletList {
    type Item = &'a Triplet;
    type IntoIter = std::slice::Iter<'a, Triplet>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_are_disjoint() {
        let mut list = TripletList::new(4);
        let first = list.allocate_columns(2);
        let second = list.allocate_columns(1);
        let third = list.allocate_columns(2);
        assert_eq!((first, second, third), (0, 2, 3));
        assert_eq!(list.next_free_index(), 5);
    }

    #[test]
    fn clear_resets_allocator() {
        let mut list = TripletList::new(0);
        let col = list.allocate_columns(1);
        list.add_triplet(3, col, 1.5);
        list.add_triplet(4, col, -1.5);
        assert_eq!(list.len(), 2);
        assert_eq!(
            list.iter().copied().collect::<Vec<_>>()[1],
            Triplet {
                row: 4,
                col: 0,
                value: -1.5
            }
        );
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.next_free_index(), 0);
    }
}
