//! Type-erased message payloads.

use std::any::{Any, TypeId};

/// A type-erased, singly-owned value.
///
/// A [`Payload`] either holds nothing, or holds exactly one value of
/// some `T: 'static + Send`. The stored type's identity is tracked
/// alongside the value so a receiver can check it ([`Payload::is`])
/// before attempting extraction.
pub struct Payload {
    type_id: Option<TypeId>,
    value: Option<Box<dyn Any + Send>>,
}

impl Payload {
    /// An empty payload.
    pub fn none() -> Self {
        Self {
            type_id: None,
            value: None,
        }
    }

    /// A payload holding `value`.
    pub fn make<T: Any + Send>(value: T) -> Self {
        Self {
            type_id: Some(TypeId::of::<T>()),
            value: Some(Box::new(value)),
        }
    }

    /// `true` if no value is stored.
    pub fn is_none(&self) -> bool {
        self.value.is_none()
    }

    /// `true` iff a value of type `T` is stored.
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == Some(TypeId::of::<T>())
    }

    /// Copy the stored value of type `T` into `out`, leaving the
    /// payload unchanged. Returns `false` (and leaves `out` untouched)
    /// if no value is stored or the stored type does not match `T`.
    pub fn copy_extract<T: Any + Clone>(&self, out: &mut T) -> bool {
        match self.value.as_ref().and_then(|v| v.downcast_ref::<T>()) {
            Some(v) => {
                *out = v.clone();
                true
            }
            None => false,
        }
    }

    /// Move the stored value of type `T` into `out`, leaving the
    /// payload empty on success. Returns `false` (and leaves `out`
    /// untouched) if no value is stored or the stored type does not
    /// match `T`.
    pub fn move_extract<T: Any>(&mut self, out: &mut T) -> bool {
        if !self.is::<T>() {
            return false;
        }
        let boxed = self.value.take().expect("is::<T>() implies a value is set");
        self.type_id = None;
        match boxed.downcast::<T>() {
            Ok(v) => {
                *out = *v;
                true
            }
            Err(boxed) => {
                // unreachable given the `is::<T>()` check above, but
                // restore state rather than silently drop the value
                self.value = Some(boxed);
                self.type_id = Some(TypeId::of::<T>());
                false
            }
        }
    }

    /// Move the stored value of type `T` out, returning it directly.
    pub fn into_inner<T: Any>(mut self) -> Option<T> {
        if !self.is::<T>() {
            return None;
        }
        let boxed = self.value.take()?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn make_and_is() {
        let p = Payload::make(42i32);
        assert!(p.is::<i32>());
        assert!(!p.is::<String>());
    }

    #[test]
    fn copy_extract_matches_type() {
        let p = Payload::make(String::from("hello"));
        let mut out = String::new();
        assert!(p.copy_extract(&mut out));
        assert_eq!(out, "hello");
        // copy leaves the payload intact
        assert!(p.is::<String>());
    }

    #[test]
    fn copy_extract_rejects_mismatch() {
        let p = Payload::make(42i32);
        let mut out = String::new();
        assert!(!p.copy_extract(&mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn move_extract_empties_payload() {
        let mut p = Payload::make(7u64);
        let mut out = 0u64;
        assert!(p.move_extract(&mut out));
        assert_eq!(out, 7);
        assert!(!p.is::<u64>());
        assert!(p.is_none());
    }

    #[test]
    fn none_payload_extracts_nothing() {
        let p = Payload::none();
        assert!(p.is_none());
        let mut out = 0i32;
        assert!(!p.copy_extract(&mut out));
    }

    #[test]
    fn into_inner_recovers_value() {
        let p = Payload::make(vec![1, 2, 3]);
        assert_eq!(p.into_inner::<Vec<i32>>(), Some(vec![1, 2, 3]));
    }
}
