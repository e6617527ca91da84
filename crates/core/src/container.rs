//! Cross-container operations
//!
//! Bulk operations between containers, built on the per-container
//! mutation API so every element-level change runs the usual pipeline
//! (constraint check, observers, edge maintenance).

use crate::error::{set_last_error, Error};
use crate::variant::{Kind, Variant};

fn src_members(src: &Variant) -> Result<Vec<Variant>, Error> {
    match src.kind() {
        Kind::Set => src.set_members_insertion(),
        Kind::Array => src.array_elements(),
        _ => Err(set_last_error(Error::WrongDataType)),
    }
}

impl Variant {
    /// Merge every pair of `src` (an object) into `self`. Existing keys
    /// are replaced when `overwrite` is set, kept otherwise.
    pub fn object_merge(&self, src: &Variant, overwrite: bool) -> Result<(), Error> {
        if self.kind() != Kind::Object || src.kind() != Kind::Object {
            return Err(set_last_error(Error::WrongDataType));
        }
        for (k, v) in src.object_entries()? {
            if !overwrite && self.object_has_key(&k)? {
                continue;
            }
            self.object_set(&k, v)?;
        }
        Ok(())
    }

    /// Add every member of `src` (a set or array) to `self`, replacing
    /// colliding members.
    pub fn set_unite(&self, src: &Variant) -> Result<(), Error> {
        if self.kind() != Kind::Set {
            return Err(set_last_error(Error::WrongDataType));
        }
        for m in src_members(src)? {
            self.set_add(m, true)?;
        }
        Ok(())
    }

    /// Keep only members whose fingerprint also appears in `src`.
    pub fn set_intersect(&self, src: &Variant) -> Result<(), Error> {
        if self.kind() != Kind::Set {
            return Err(set_last_error(Error::WrongDataType));
        }
        let mut keep: Vec<Variant> = Vec::new();
        for o in src_members(src)? {
            // a member of src that lacks the key fields simply matches
            // nothing
            if let Ok(Some(member)) = self.set_find(&o) {
                keep.push(member);
            }
        }
        for m in self.set_members_insertion()? {
            let kept = keep
                .iter()
                .any(|k| k.ptr_id() == m.ptr_id() && k.equals(&m));
            if !kept {
                self.set_remove(&m)?;
            }
        }
        Ok(())
    }

    /// Remove members whose fingerprint appears in `src`.
    pub fn set_subtract(&self, src: &Variant) -> Result<(), Error> {
        if self.kind() != Kind::Set {
            return Err(set_last_error(Error::WrongDataType));
        }
        for o in src_members(src)? {
            match self.set_remove(&o) {
                Ok(_) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Symmetric difference: members present on exactly one side remain.
    pub fn set_xor(&self, src: &Variant) -> Result<(), Error> {
        if self.kind() != Kind::Set {
            return Err(set_last_error(Error::WrongDataType));
        }
        for o in src_members(src)? {
            match self.set_remove(&o) {
                Ok(_) => {}
                Err(Error::NotFound) => self.set_add(o, false)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Replace members of `self` that collide with members of `src`;
    /// members of `src` with no counterpart are ignored.
    pub fn set_overwrite(&self, src: &Variant) -> Result<(), Error> {
        if self.kind() != Kind::Set {
            return Err(set_last_error(Error::WrongDataType));
        }
        for o in src_members(src)? {
            if self.set_contains(&o)? {
                self.set_add(o, true)?;
            }
        }
        Ok(())
    }

    /// Append every element of `another` (an array) to `self`.
    pub fn array_append_another(&self, another: &Variant) -> Result<(), Error> {
        for v in another.array_elements()? {
            self.array_append(v)?;
        }
        Ok(())
    }

    /// Prepend the elements of `another`, preserving their order.
    pub fn array_prepend_another(&self, another: &Variant) -> Result<(), Error> {
        for (i, v) in another.array_elements()?.into_iter().enumerate() {
            self.array_insert_before(i, v)?;
        }
        Ok(())
    }

    /// Insert the elements of `another` before `idx`, preserving order.
    pub fn array_insert_another_before(
        &self,
        idx: usize,
        another: &Variant,
    ) -> Result<(), Error> {
        for (i, v) in another.array_elements()?.into_iter().enumerate() {
            self.array_insert_before(idx + i, v)?;
        }
        Ok(())
    }

    /// Insert the elements of `another` after `idx`, preserving order.
    pub fn array_insert_another_after(
        &self,
        idx: isize,
        another: &Variant,
    ) -> Result<(), Error> {
        let base = (idx + 1) as usize;
        for (i, v) in another.array_elements()?.into_iter().enumerate() {
            self.array_insert_before(base + i, v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(id: i64) -> Variant {
        let o = Variant::object();
        o.object_set("id", Variant::longint(id)).unwrap();
        o
    }

    fn ids(s: &Variant) -> Vec<i64> {
        s.set_members()
            .unwrap()
            .iter()
            .map(|m| {
                m.object_get("id")
                    .unwrap()
                    .unwrap()
                    .cast_to_i64(false)
                    .unwrap()
            })
            .collect()
    }

    fn set_of(idsv: &[i64]) -> Variant {
        let s = Variant::set(Some(&["id"]));
        for &i in idsv {
            s.set_add(obj(i), false).unwrap();
        }
        s
    }

    #[test]
    fn test_unite() {
        let a = set_of(&[1, 2]);
        let b = set_of(&[2, 3]);
        a.set_unite(&b).unwrap();
        assert_eq!(ids(&a), vec![1, 2, 3]);
    }

    #[test]
    fn test_intersect() {
        let a = set_of(&[1, 2, 3]);
        let b = set_of(&[2, 3, 4]);
        a.set_intersect(&b).unwrap();
        assert_eq!(ids(&a), vec![2, 3]);
    }

    #[test]
    fn test_subtract() {
        let a = set_of(&[1, 2, 3]);
        let b = set_of(&[2, 9]);
        a.set_subtract(&b).unwrap();
        assert_eq!(ids(&a), vec![1, 3]);
    }

    #[test]
    fn test_xor() {
        let a = set_of(&[1, 2]);
        let b = set_of(&[2, 3]);
        a.set_xor(&b).unwrap();
        assert_eq!(ids(&a), vec![1, 3]);
    }

    #[test]
    fn test_overwrite() {
        let a = Variant::set(Some(&["id"]));
        let m = obj(1);
        m.object_set("v", Variant::longint(10)).unwrap();
        a.set_add(m, false).unwrap();
        a.set_add(obj(2), false).unwrap();

        let b = Variant::set(Some(&["id"]));
        let n = obj(1);
        n.object_set("v", Variant::longint(99)).unwrap();
        b.set_add(n, false).unwrap();
        b.set_add(obj(7), false).unwrap();

        a.set_overwrite(&b).unwrap();
        assert_eq!(ids(&a), vec![1, 2]); // no new members
        let got = a.set_find(&obj(1)).unwrap().unwrap();
        assert_eq!(
            got.object_get("v").unwrap().unwrap().cast_to_i64(false).unwrap(),
            99
        );
    }

    #[test]
    fn test_unite_from_array() {
        let a = set_of(&[1]);
        let arr = Variant::array_from([obj(2), obj(3)]);
        a.set_unite(&arr).unwrap();
        assert_eq!(ids(&a), vec![1, 2, 3]);
    }

    #[test]
    fn test_object_merge() {
        let a = Variant::object();
        a.object_set("x", Variant::longint(1)).unwrap();
        let b = Variant::object();
        b.object_set("x", Variant::longint(9)).unwrap();
        b.object_set("y", Variant::longint(2)).unwrap();

        a.object_merge(&b, false).unwrap();
        assert_eq!(
            a.object_get("x").unwrap().unwrap().cast_to_i64(false).unwrap(),
            1
        );
        a.object_merge(&b, true).unwrap();
        assert_eq!(
            a.object_get("x").unwrap().unwrap().cast_to_i64(false).unwrap(),
            9
        );
        assert_eq!(
            a.object_get("y").unwrap().unwrap().cast_to_i64(false).unwrap(),
            2
        );
    }

    #[test]
    fn test_array_another_ops() {
        let a = Variant::array_from([Variant::longint(1), Variant::longint(4)]);
        let b = Variant::array_from([Variant::longint(2), Variant::longint(3)]);
        a.array_insert_another_before(1, &b).unwrap();
        let vals: Vec<i64> = a
            .array_elements()
            .unwrap()
            .iter()
            .map(|v| v.cast_to_i64(false).unwrap())
            .collect();
        assert_eq!(vals, vec![1, 2, 3, 4]);

        let c = Variant::array_from([Variant::longint(0)]);
        a.array_prepend_another(&c).unwrap();
        assert_eq!(a.array_size().unwrap(), 5);
        assert_eq!(
            a.array_get(0).unwrap().cast_to_i64(false).unwrap(),
            0
        );
    }
}
