//! Parent/child bookkeeping for sandboxes.
//!
//! Every sandbox of a pool is a node in the [`SandboxArena`], keyed by [`SandboxId`]. A node
//! holds its parent's id, its children's ids and a reference count on its cgroup: one for the
//! sandbox itself plus one per child still charged to it. The node (and with it the cgroup and
//! the memory reserved for it) is released only when that count reaches zero, and releasing a
//! node drops the reference it held on its parent.

use std::{
    collections::{BTreeSet, HashMap},
    fmt::Write,
    sync::{Mutex, MutexGuard},
};

use crate::{
    cgroup::Cgroup,
    sandbox::{SandboxId, SandboxKind},
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The parent/child graph of a pool's sandboxes.
#[derive(Debug, Default)]
pub struct SandboxArena {
    nodes: Mutex<HashMap<SandboxId, ArenaNode>>,
}

#[derive(Debug)]
struct ArenaNode {
    kind: SandboxKind,
    parent: Option<SandboxId>,
    children: BTreeSet<SandboxId>,
    cgroup: Cgroup,
    mem_limit_mb: u64,
    cg_ref_count: usize,
    destroyed: bool,
}

/// Resources freed when a node's reference count drops to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// The sandbox whose node was removed.
    pub id: SandboxId,

    /// The cgroup to return to its pool.
    pub cgroup: Cgroup,

    /// The memory to return to the memory pool.
    pub mem_limit_mb: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parentless node holding one reference on `cgroup`.
    pub fn register(
        &self,
        id: SandboxId,
        kind: SandboxKind,
        cgroup: Cgroup,
        mem_limit_mb: u64,
    ) -> WarmboxResult<()> {
        let mut nodes = self.lock()?;
        if nodes.contains_key(&id) {
            return Err(WarmboxError::Fatal(format!(
                "sandbox {} registered twice",
                id
            )));
        }

        nodes.insert(
            id,
            ArenaNode {
                kind,
                parent: None,
                children: BTreeSet::new(),
                cgroup,
                mem_limit_mb,
                cg_ref_count: 1,
                destroyed: false,
            },
        );
        Ok(())
    }

    /// Makes `child` a child of `parent`, adding a reference to the parent's cgroup.
    pub fn link(&self, parent: SandboxId, child: SandboxId) -> WarmboxResult<()> {
        let mut nodes = self.lock()?;

        match nodes.get(&child) {
            None => return Err(WarmboxError::SandboxNotFound(child)),
            Some(node) if node.parent.is_some() => {
                return Err(WarmboxError::Isolation(format!(
                    "sandbox {} already has a parent",
                    child
                )))
            }
            Some(_) => {}
        }

        let parent_node = nodes
            .get_mut(&parent)
            .filter(|node| !node.destroyed)
            .ok_or(WarmboxError::SandboxNotFound(parent))?;
        parent_node.children.insert(child);
        parent_node.cg_ref_count += 1;

        if let Some(node) = nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        Ok(())
    }

    /// Marks `id` destroyed and drops its own reference.
    ///
    /// Returns the nodes whose count reached zero, starting with `id` and walking up through
    /// ancestors that were only kept alive by it. Releasing an unknown or already destroyed
    /// sandbox returns nothing.
    pub fn release(&self, id: SandboxId) -> WarmboxResult<Vec<Released>> {
        let mut nodes = self.lock()?;

        match nodes.get_mut(&id) {
            Some(node) if !node.destroyed => node.destroyed = true,
            _ => return Ok(Vec::new()),
        }

        let mut released = Vec::new();
        let mut current = id;
        loop {
            let Some(node) = nodes.get_mut(&current) else {
                break;
            };
            node.cg_ref_count = node.cg_ref_count.saturating_sub(1);
            if node.cg_ref_count > 0 {
                break;
            }

            let Some(node) = nodes.remove(&current) else {
                break;
            };
            released.push(Released {
                id: current,
                cgroup: node.cgroup,
                mem_limit_mb: node.mem_limit_mb,
            });

            match node.parent {
                Some(parent) => {
                    if let Some(parent_node) = nodes.get_mut(&parent) {
                        parent_node.children.remove(&current);
                    }
                    current = parent;
                }
                None => break,
            }
        }

        Ok(released)
    }

    /// The number of references on the sandbox's cgroup, or `None` once it was released.
    pub fn cgroup_ref_count(&self, id: SandboxId) -> Option<usize> {
        self.lock().ok()?.get(&id).map(|node| node.cg_ref_count)
    }

    /// The sandbox's parent.
    pub fn parent(&self, id: SandboxId) -> Option<SandboxId> {
        self.lock().ok()?.get(&id).and_then(|node| node.parent)
    }

    /// Children still charged to the sandbox's cgroup, in id order.
    pub fn children(&self, id: SandboxId) -> Vec<SandboxId> {
        self.lock()
            .ok()
            .and_then(|nodes| nodes.get(&id).map(|node| node.children.iter().copied().collect()))
            .unwrap_or_default()
    }

    /// Whether the sandbox was destroyed. Unknown sandboxes count as destroyed.
    pub fn is_destroyed(&self, id: SandboxId) -> bool {
        self.lock()
            .ok()
            .and_then(|nodes| nodes.get(&id).map(|node| node.destroyed))
            .unwrap_or(true)
    }

    /// `id` and everything below it, children before their parents.
    pub fn descendants_post_order(&self, id: SandboxId) -> Vec<SandboxId> {
        let Ok(nodes) = self.lock() else {
            return Vec::new();
        };

        let mut order = Vec::new();
        if nodes.contains_key(&id) {
            collect_post_order(&nodes, id, &mut order);
        }
        order
    }

    /// The number of nodes still holding resources.
    pub fn len(&self) -> usize {
        self.lock().map(|nodes| nodes.len()).unwrap_or(0)
    }

    /// Whether every node has been released.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the forest, one node per line, children indented under their parents.
    pub fn render(&self) -> String {
        let Ok(nodes) = self.lock() else {
            return String::from("<arena unavailable>\n");
        };

        let mut roots: Vec<SandboxId> = nodes
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        roots.sort();

        let mut out = String::new();
        for root in roots {
            render_node(&nodes, root, 0, &mut out);
        }
        out
    }

    fn lock(&self) -> WarmboxResult<MutexGuard<'_, HashMap<SandboxId, ArenaNode>>> {
        self.nodes
            .lock()
            .map_err(|e| WarmboxError::Fatal(format!("sandbox arena lock poisoned: {}", e)))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn collect_post_order(
    nodes: &HashMap<SandboxId, ArenaNode>,
    id: SandboxId,
    order: &mut Vec<SandboxId>,
) {
    if let Some(node) = nodes.get(&id) {
        for child in &node.children {
            collect_post_order(nodes, *child, order);
        }
    }
    order.push(id);
}

fn render_node(
    nodes: &HashMap<SandboxId, ArenaNode>,
    id: SandboxId,
    depth: usize,
    out: &mut String,
) {
    let Some(node) = nodes.get(&id) else {
        return;
    };

    let _ = writeln!(
        out,
        "{:indent$}SB-{} [{}] cg={} refs={} mem={}MiB{}",
        "",
        id,
        node.kind,
        node.cgroup.get_slot(),
        node.cg_ref_count,
        node.mem_limit_mb,
        if node.destroyed { " (destroyed)" } else { "" },
        indent = depth * 2
    );

    for child in &node.children {
        render_node(nodes, *child, depth + 1, out);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cgroup::CgroupPool;

    async fn cgroups(pool: &CgroupPool, n: usize) -> Vec<Cgroup> {
        let mut groups = Vec::new();
        for _ in 0..n {
            groups.push(pool.get_cgroup(10, true).await.unwrap());
        }
        groups
    }

    fn id(n: u64) -> SandboxId {
        SandboxId::new(n)
    }

    #[tokio::test]
    async fn test_child_keeps_parent_cgroup_alive() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let pool = CgroupPool::new(temp.path(), "arena").await?;
        let mut groups = cgroups(&pool, 2).await.into_iter();

        let arena = SandboxArena::new();
        arena.register(id(1), SandboxKind::Zygote, groups.next().unwrap(), 10)?;
        arena.register(id(2), SandboxKind::Leaf, groups.next().unwrap(), 20)?;
        arena.link(id(1), id(2))?;

        assert_eq!(arena.cgroup_ref_count(id(1)), Some(2));
        assert_eq!(arena.children(id(1)), vec![id(2)]);
        assert_eq!(arena.parent(id(2)), Some(id(1)));

        // The parent goes first but its cgroup is still charged by the child.
        assert!(arena.release(id(1))?.is_empty());
        assert!(arena.is_destroyed(id(1)));
        assert_eq!(arena.cgroup_ref_count(id(1)), Some(1));

        let released = arena.release(id(2))?;
        let ids: Vec<_> = released.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![id(2), id(1)]);
        assert_eq!(released[0].mem_limit_mb, 20);
        assert!(arena.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_release_is_idempotent() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let pool = CgroupPool::new(temp.path(), "arena").await?;
        let group = pool.get_cgroup(10, true).await?;

        let arena = SandboxArena::new();
        arena.register(id(7), SandboxKind::Leaf, group, 10)?;

        assert_eq!(arena.release(id(7))?.len(), 1);
        assert!(arena.release(id(7))?.is_empty());
        assert!(arena.release(id(99))?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_link_rejects_destroyed_parent() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let pool = CgroupPool::new(temp.path(), "arena").await?;
        let mut groups = cgroups(&pool, 3).await.into_iter();

        let arena = SandboxArena::new();
        arena.register(id(1), SandboxKind::Zygote, groups.next().unwrap(), 10)?;
        arena.register(id(2), SandboxKind::Zygote, groups.next().unwrap(), 10)?;
        arena.register(id(3), SandboxKind::Leaf, groups.next().unwrap(), 10)?;
        arena.link(id(1), id(2))?;

        assert!(arena.link(id(1), id(2)).is_err());

        arena.release(id(1))?;
        assert!(matches!(
            arena.link(id(1), id(3)),
            Err(WarmboxError::SandboxNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_post_order_and_render() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let pool = CgroupPool::new(temp.path(), "arena").await?;
        let mut groups = cgroups(&pool, 4).await.into_iter();

        let arena = SandboxArena::new();
        arena.register(id(1), SandboxKind::Zygote, groups.next().unwrap(), 10)?;
        arena.register(id(2), SandboxKind::Zygote, groups.next().unwrap(), 10)?;
        arena.register(id(3), SandboxKind::Leaf, groups.next().unwrap(), 10)?;
        arena.register(id(4), SandboxKind::Leaf, groups.next().unwrap(), 10)?;
        arena.link(id(1), id(2))?;
        arena.link(id(2), id(3))?;
        arena.link(id(1), id(4))?;

        assert_eq!(
            arena.descendants_post_order(id(1)),
            vec![id(3), id(2), id(4), id(1)]
        );

        let rendered = arena.render();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("SB-1 [zygote]"));
        assert!(lines[1].starts_with("  SB-2 [zygote]"));
        assert!(lines[2].starts_with("    SB-3 [leaf]"));
        assert!(lines[3].starts_with("  SB-4 [leaf]"));
        Ok(())
    }
}
