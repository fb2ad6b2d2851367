//! Pagination primitives shared by the store traits.

/// Opaque pagination cursor: the record id to resume after.
pub type Cursor = Option<u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Applies a cursor/limit/direction window over id-ordered records.
pub fn paginate<T, F>(mut records: Vec<T>, id_of: F, cursor: Cursor, limit: usize, direction: Direction) -> Vec<T>
where
    F: Fn(&T) -> u64,
{
    match direction {
        Direction::Ascending => records.sort_by_key(|r| id_of(r)),
        Direction::Descending => records.sort_by_key(|r| std::cmp::Reverse(id_of(r))),
    }

    if let Some(after) = cursor {
        records.retain(|r| match direction {
            Direction::Ascending => id_of(r) > after,
            Direction::Descending => id_of(r) < after,
        });
    }

    records.truncate(limit);
    records
}
