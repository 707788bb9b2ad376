//! Path resolution: walk a `/`-separated path one component at a time,
//! looking each one up in its directory via [`DirIter`].
//!
//! The teacher has no equivalent of this as a standalone component — its
//! `Dir::find` takes an already-split `Vec<&str>` and recurses by
//! re-opening a `VirtFile` per component, trusting the on-disk `.`/`..`
//! entries `create()` wrote for the `..` case. This module is new: it is
//! loosely grounded on the *dispatch* shape of the teacher's
//! `find_by_name` (try short-name match, fall back to long-name match)
//! but does not trust on-disk `..` — cluster `0` is a resolver-internal
//! sentinel for "the FAT12/16 fixed root region" (never a real data
//! cluster, which always starts at 2), and each descent pushes the
//! directory being left onto an explicit ancestor stack so `..` is
//! answered from resolver state, never from a directory entry.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::bpb::Bpb;
use crate::card::Card;
use crate::dir::{DirEvent, DirInfo, DirIter};
use crate::error::Error;
use crate::fat::FatTable;

pub const MAX_PATH_COMPONENTS: usize = 256;
pub const MAX_PATH_BYTES: usize = 1024;

/// Split a path into non-empty, non-`.` components, enforcing the
/// length and component-count bounds.
pub fn split_path(path: &str) -> Result<Vec<&str>, Error> {
    if path.len() > MAX_PATH_BYTES {
        return Err(Error::PathTooLong);
    }
    let mut comps = Vec::new();
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if comps.len() >= MAX_PATH_COMPONENTS {
            return Err(Error::PathTooLong);
        }
        comps.push(part);
    }
    Ok(comps)
}

/// Result of resolving a path: the matched entry (`None` if the path
/// resolves to the volume root itself) and the cluster representation
/// of the directory that contains it.
pub struct Resolved {
    pub entry: Option<DirInfo>,
    pub parent_cluster: u32,
}

fn dir_iter_for(card: Arc<Card>, bpb: &Bpb, cluster_repr: u32) -> DirIter {
    if cluster_repr == 0 {
        DirIter::fixed_root(card, bpb.root_dir_first_sector(), bpb.root_dir_sector_count())
    } else {
        DirIter::chain(card, cluster_repr, bpb.sectors_per_cluster as u32)
    }
}

fn lookup_in_dir(
    card: Arc<Card>,
    bpb: &Bpb,
    fat: &mut FatTable,
    cluster_repr: u32,
    name: &str,
) -> Result<Option<DirInfo>, Error> {
    let mut iter = dir_iter_for(card, bpb, cluster_repr);
    loop {
        match iter.next_entry(bpb, fat)? {
            DirEvent::Eof => return Ok(None),
            DirEvent::Entry(info) => {
                if info.name.eq_ignore_ascii_case(name) {
                    return Ok(Some(info));
                }
            }
        }
    }
}

/// List every entry in the directory identified by `cluster_repr`
/// (`0` for the FAT12/16 fixed root).
pub fn list_dir(card: Arc<Card>, bpb: &Bpb, fat: &mut FatTable, cluster_repr: u32) -> Result<Vec<DirInfo>, Error> {
    let mut iter = dir_iter_for(card, bpb, cluster_repr);
    let mut out = Vec::new();
    loop {
        match iter.next_entry(bpb, fat)? {
            DirEvent::Eof => return Ok(out),
            DirEvent::Entry(info) => out.push(info),
        }
    }
}

/// Resolve `path` against `cwd_cluster`, maintaining an explicit
/// ancestor stack so `..` never depends on what is actually stored on
/// disk. A leading `/` in `path` starts from the volume root instead of
/// `cwd_cluster`, same as any other rooted path resolution.
pub fn resolve(
    card: Arc<Card>,
    bpb: &Bpb,
    fat: &mut FatTable,
    path: &str,
    cwd_cluster: u32,
) -> Result<Resolved, Error> {
    let comps = split_path(path)?;
    let mut cluster = if path.starts_with('/') {
        bpb.root_cluster()
    } else {
        cwd_cluster
    };
    let mut parent = cluster;
    let mut entry: Option<DirInfo> = None;
    let mut ancestors: Vec<u32> = Vec::new();

    for comp in &comps {
        if *comp == ".." {
            entry = None;
            if let Some(prev) = ancestors.pop() {
                cluster = prev;
                parent = ancestors.last().copied().unwrap_or_else(|| bpb.root_cluster());
            }
            continue;
        }

        parent = cluster;
        let found = lookup_in_dir(Arc::clone(&card), bpb, fat, cluster, comp)?
            .ok_or(Error::NotFound)?;

        if found.is_dir {
            ancestors.push(cluster);
            cluster = if found.first_cluster == 0 {
                bpb.root_cluster()
            } else {
                found.first_cluster
            };
        }
        entry = Some(found);
    }

    Ok(Resolved {
        entry,
        parent_cluster: parent,
    })
}

/// Resolve everything but the final component, returning the directory
/// cluster that should contain it and the leaf name itself. Used by
/// create/mkdir/unlink, which need the parent directory regardless of
/// whether the leaf currently exists.
pub fn resolve_parent<'a>(
    card: Arc<Card>,
    bpb: &Bpb,
    fat: &mut FatTable,
    path: &'a str,
    cwd_cluster: u32,
) -> Result<(u32, &'a str), Error> {
    let comps = split_path(path)?;
    let leaf = *comps.last().ok_or(Error::InvalidParam)?;
    if leaf == ".." {
        return Err(Error::InvalidParam);
    }
    if comps.len() == 1 {
        let start = if path.starts_with('/') {
            bpb.root_cluster()
        } else {
            cwd_cluster
        };
        return Ok((start, leaf));
    }

    let mut dir_path = if path.starts_with('/') {
        alloc::string::String::from("/")
    } else {
        alloc::string::String::new()
    };
    dir_path.push_str(&comps[..comps.len() - 1].join("/"));
    let resolved = resolve(card, bpb, fat, &dir_path, cwd_cluster)?;
    let cluster = match resolved.entry {
        Some(info) if info.is_dir => {
            if info.first_cluster == 0 {
                bpb.root_cluster()
            } else {
                info.first_cluster
            }
        }
        None => bpb.root_cluster(),
        Some(_) => return Err(Error::NotDir),
    };
    Ok((cluster, leaf))
}
