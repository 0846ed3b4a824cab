pub(crate) fn get_page_size() -> usize {
    use libc::{sysconf, _SC_PAGE_SIZE};

    unsafe { sysconf(_SC_PAGE_SIZE) as usize }
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod test {
    use super::{align_up, ceil_div, get_page_size};

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(48, 16), 48);
        assert_eq!(align_up(49, 16), 64);
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(0, 4), 0);
        assert_eq!(ceil_div(1, 4), 1);
        assert_eq!(ceil_div(4, 4), 1);
        assert_eq!(ceil_div(5, 4), 2);
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = get_page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }
}
