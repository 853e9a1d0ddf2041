/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The versioning protocol. A write's logical position is the pair
//! `(db_version, seq)`: `db_version` advances by at most one per committed
//! transaction, `seq` orders writes within it. The origin site id breaks
//! remaining ties so that concurrent writes resolve the same way on every
//! replica.

use std::cmp::Ordering;

/// The version metadata attached to one clock row / one change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockStamp {
    pub db_version: i64,
    pub seq: i64,
    /// None means the write originated on the local site.
    pub site_id: Option<Vec<u8>>,
}

impl ClockStamp {
    /// The site id to compare with: a stored NULL stands for this site.
    fn effective_site<'a>(&'a self, local_site: &'a [u8]) -> &'a [u8] {
        match &self.site_id {
            Some(s) => s,
            None => local_site,
        }
    }

    /// Total order over change events: greater `db_version` wins, then
    /// greater `seq`, then the lexicographically greater site id.
    pub fn cmp_at(&self, other: &ClockStamp, local_site: &[u8]) -> Ordering {
        self.db_version
            .cmp(&other.db_version)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| {
                self.effective_site(local_site)
                    .cmp(other.effective_site(local_site))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stamp(db_version: i64, seq: i64, site_id: Option<&[u8]>) -> ClockStamp {
        ClockStamp {
            db_version,
            seq,
            site_id: site_id.map(|s| s.to_vec()),
        }
    }

    const LOCAL: &[u8] = &[5u8; 16];

    #[test]
    fn test_db_version_dominates() {
        let a = stamp(2, 0, None);
        let b = stamp(1, 9, Some(&[0xff; 16]));
        assert_eq!(a.cmp_at(&b, LOCAL), Ordering::Greater);
        assert_eq!(b.cmp_at(&a, LOCAL), Ordering::Less);
    }

    #[test]
    fn test_seq_breaks_version_ties() {
        let a = stamp(3, 2, None);
        let b = stamp(3, 1, None);
        assert_eq!(a.cmp_at(&b, LOCAL), Ordering::Greater);
    }

    #[test]
    fn test_site_id_breaks_full_ties() {
        let a = stamp(3, 1, Some(&[9u8; 16]));
        let b = stamp(3, 1, Some(&[1u8; 16]));
        assert_eq!(a.cmp_at(&b, LOCAL), Ordering::Greater);
    }

    #[test]
    fn test_null_site_compares_as_local() {
        let local = stamp(3, 1, None);
        let remote_lower = stamp(3, 1, Some(&[0u8; 16]));
        let remote_higher = stamp(3, 1, Some(&[0xau8; 16]));
        assert_eq!(local.cmp_at(&remote_lower, LOCAL), Ordering::Greater);
        assert_eq!(local.cmp_at(&remote_higher, LOCAL), Ordering::Less);
        assert_eq!(
            local.cmp_at(&stamp(3, 1, Some(LOCAL)), LOCAL),
            Ordering::Equal
        );
    }
}
