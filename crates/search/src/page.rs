use serde::Serialize;

/// One page of an already-fetched result. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn has_next(&self) -> bool { self.page < self.total_pages }

    pub fn has_prev(&self) -> bool { self.page > 1 }
}

/// Slice `items` into page `page` of `per_page`. `page` is clamped to
/// `1..=total_pages`, `per_page` to at least 1; an empty input has one empty page.
pub fn paginate<T: Clone>(items: &[T], page: usize, per_page: usize) -> Page<T> {
    let per_page = per_page.max(1);
    let total = items.len();
    let total_pages = total.div_ceil(per_page).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let end = (start + per_page).min(total);
    Page { items: items[start.min(total)..end].to_vec(), page, per_page, total, total_pages }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middle_and_last_pages() {
        let v: Vec<u32> = (1..=25).collect();
        let p = paginate(&v, 2, 10);
        assert_eq!(p.items, (11..=20).collect::<Vec<_>>());
        assert_eq!((p.total, p.total_pages), (25, 3));
        assert!(p.has_prev() && p.has_next());

        let last = paginate(&v, 3, 10);
        assert_eq!(last.items, vec![21, 22, 23, 24, 25]);
        assert!(!last.has_next());
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let v = vec!['a', 'b', 'c'];
        assert_eq!(paginate(&v, 0, 2).page, 1);
        assert_eq!(paginate(&v, 9, 2).items, vec!['c']);
        assert_eq!(paginate(&v, 1, 0).items, vec!['a']);
    }

    #[test]
    fn empty_input_has_one_empty_page() {
        let p = paginate::<u8>(&[], 3, 10);
        assert_eq!(p.page, 1);
        assert_eq!(p.total_pages, 1);
        assert!(p.items.is_empty());
        assert!(!p.has_next() && !p.has_prev());
    }
}
