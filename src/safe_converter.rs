
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening() {
        let n: usize = 17u32.safe_cast();
        assert_eq!(n, 17);
    }

    #[test]
    fn test_prechecked_in_range() {
        let n: u8 = 255usize.prechecked_cast();
        assert_eq!(n, 255);
        let n: u32 = 70_000usize.prechecked_cast();
        assert_eq!(n, 70_000);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u16 = 70_000usize.prechecked_cast();
    }
}
