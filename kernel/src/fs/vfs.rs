//! Virtual File System
//!
//! Path resolution and node operations over whatever filesystem has
//! published itself as root. Nodes live in an arena and are addressed by
//! handle; nodes produced by `readdir`/`finddir` belong to the caller and
//! must be given back with `release` when done.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use super::{FsError, FsResult};

/// Arena index of a live node
pub type NodeHandle = usize;

/// Node type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Pipe,
    Symlink,
    MountPoint,
}

/// A resolved node
#[derive(Debug, Clone)]
pub struct VfsNode {
    pub name: String,
    pub kind: NodeKind,
    pub inode: u32,
    pub length: u32,
    pub parent: Option<NodeHandle>,
}

/// What a directory lookup yields before it becomes a node
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub inode: u32,
    pub kind: NodeKind,
    pub length: u32,
}

/// The operation set a mounted filesystem provides. Directory operations
/// are only ever called with directory nodes, file I/O only with files;
/// the VFS enforces that split so implementations don't have to.
pub trait Filesystem: Send {
    fn fs_name(&self) -> &'static str;

    fn open(&mut self, _node: &VfsNode, _flags: u32) -> FsResult<()> {
        Ok(())
    }

    fn close(&mut self, _node: &VfsNode) {}

    fn read(&mut self, node: &VfsNode, offset: u32, buf: &mut [u8]) -> FsResult<usize>;

    fn write(&mut self, node: &VfsNode, offset: u32, buf: &[u8]) -> FsResult<usize>;

    fn readdir(&mut self, node: &VfsNode, index: usize) -> Option<DirEntryInfo>;

    fn finddir(&mut self, node: &VfsNode, name: &str) -> Option<DirEntryInfo>;

    fn create(&mut self, node: &VfsNode, name: &str) -> FsResult<u32>;

    fn delete(&mut self, node: &VfsNode, name: &str) -> FsResult<()>;
}

struct Vfs {
    nodes: Vec<Option<VfsNode>>,
    free_slots: Vec<usize>,
    root: Option<NodeHandle>,
    fs: Option<Box<dyn Filesystem>>,
}

impl Vfs {
    const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: None,
            fs: None,
        }
    }

    fn insert(&mut self, node: VfsNode) -> NodeHandle {
        if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn remove(&mut self, handle: NodeHandle) {
        if handle < self.nodes.len() && self.nodes[handle].take().is_some() {
            self.free_slots.push(handle);
        }
    }

    fn node(&self, handle: NodeHandle) -> Option<&VfsNode> {
        self.nodes.get(handle)?.as_ref()
    }

    fn adopt_entry(&mut self, entry: DirEntryInfo, parent: NodeHandle) -> NodeHandle {
        self.insert(VfsNode {
            name: entry.name,
            kind: entry.kind,
            inode: entry.inode,
            length: entry.length,
            parent: Some(parent),
        })
    }
}

static VFS: Mutex<Vfs> = Mutex::new(Vfs::new());

/// Publish a filesystem as the root of the namespace. Replaces any
/// previous root wholesale.
pub fn set_root(fs: Box<dyn Filesystem>) {
    let mut vfs = VFS.lock();
    vfs.nodes.clear();
    vfs.free_slots.clear();
    vfs.fs = Some(fs);
    let root = vfs.insert(VfsNode {
        name: String::from("/"),
        kind: NodeKind::Directory,
        inode: 0,
        length: 0,
        parent: None,
    });
    vfs.root = Some(root);
}

/// Handle of the root directory
pub fn root() -> Option<NodeHandle> {
    VFS.lock().root
}

/// Give a node back to the arena. Required for every handle produced by
/// `resolve_path`, `readdir` or `finddir` (the root handle excepted).
pub fn release(handle: NodeHandle) {
    let mut vfs = VFS.lock();
    if vfs.root == Some(handle) {
        return;
    }
    vfs.remove(handle);
}

/// Walk a `/`-separated absolute path from the root, one `finddir` per
/// component. Empty components (double slashes, trailing slash) are
/// skipped. Intermediate nodes are released automatically; the final node
/// belongs to the caller.
pub fn resolve_path(path: &str) -> FsResult<NodeHandle> {
    let mut vfs = VFS.lock();
    let mut current = vfs.root.ok_or(FsError::NotFound)?;

    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }

        let node = vfs.node(current).ok_or(FsError::NotFound)?.clone();
        if node.kind != NodeKind::Directory {
            if vfs.root != Some(current) {
                vfs.remove(current);
            }
            return Err(FsError::NotDirectory);
        }

        let fs = vfs.fs.as_mut().ok_or(FsError::NotFound)?;
        let entry = match fs.finddir(&node, component) {
            Some(e) => e,
            None => {
                if vfs.root != Some(current) {
                    vfs.remove(current);
                }
                return Err(FsError::NotFound);
            }
        };

        let next = vfs.adopt_entry(entry, current);
        if vfs.root != Some(current) {
            vfs.remove(current);
        }
        current = next;
    }

    Ok(current)
}

/// Resolve and open
pub fn open(path: &str, flags: u32) -> FsResult<NodeHandle> {
    let handle = resolve_path(path)?;
    let mut vfs = VFS.lock();
    let node = vfs.node(handle).ok_or(FsError::NotFound)?.clone();
    if let Some(fs) = vfs.fs.as_mut() {
        fs.open(&node, flags)?;
    }
    Ok(handle)
}

/// Close and release
pub fn close(handle: NodeHandle) {
    let mut vfs = VFS.lock();
    if let Some(node) = vfs.node(handle).cloned() {
        if let Some(fs) = vfs.fs.as_mut() {
            fs.close(&node);
        }
    }
    if vfs.root != Some(handle) {
        vfs.remove(handle);
    }
}

/// Read from a file node
pub fn read(handle: NodeHandle, offset: u32, buf: &mut [u8]) -> FsResult<usize> {
    let mut vfs = VFS.lock();
    let node = vfs.node(handle).ok_or(FsError::NotFound)?.clone();
    if node.kind == NodeKind::Directory {
        return Err(FsError::NotFile);
    }
    vfs.fs.as_mut().ok_or(FsError::NotFound)?.read(&node, offset, buf)
}

/// Write to a file node
pub fn write(handle: NodeHandle, offset: u32, buf: &[u8]) -> FsResult<usize> {
    let mut vfs = VFS.lock();
    let node = vfs.node(handle).ok_or(FsError::NotFound)?.clone();
    if node.kind == NodeKind::Directory {
        return Err(FsError::NotFile);
    }
    vfs.fs.as_mut().ok_or(FsError::NotFound)?.write(&node, offset, buf)
}

/// n-th entry of a directory as a fresh caller-owned node
pub fn readdir(handle: NodeHandle, index: usize) -> Option<NodeHandle> {
    let mut vfs = VFS.lock();
    let node = vfs.node(handle)?.clone();
    if node.kind != NodeKind::Directory {
        return None;
    }
    let entry = vfs.fs.as_mut()?.readdir(&node, index)?;
    Some(vfs.adopt_entry(entry, handle))
}

/// Named child of a directory as a fresh caller-owned node
pub fn finddir(handle: NodeHandle, name: &str) -> Option<NodeHandle> {
    let mut vfs = VFS.lock();
    let node = vfs.node(handle)?.clone();
    if node.kind != NodeKind::Directory {
        return None;
    }
    let entry = vfs.fs.as_mut()?.finddir(&node, name)?;
    Some(vfs.adopt_entry(entry, handle))
}

/// Create a file inside a directory node
pub fn create(handle: NodeHandle, name: &str) -> FsResult<u32> {
    let mut vfs = VFS.lock();
    let node = vfs.node(handle).ok_or(FsError::NotFound)?.clone();
    if node.kind != NodeKind::Directory {
        return Err(FsError::NotDirectory);
    }
    vfs.fs.as_mut().ok_or(FsError::NotFound)?.create(&node, name)
}

/// Delete a named child of a directory node
pub fn delete(handle: NodeHandle, name: &str) -> FsResult<()> {
    let mut vfs = VFS.lock();
    let node = vfs.node(handle).ok_or(FsError::NotFound)?.clone();
    if node.kind != NodeKind::Directory {
        return Err(FsError::NotDirectory);
    }
    vfs.fs.as_mut().ok_or(FsError::NotFound)?.delete(&node, name)
}

/// Snapshot a node's metadata
pub fn stat(handle: NodeHandle) -> Option<VfsNode> {
    VFS.lock().node(handle).cloned()
}
