use bstr::BStr;
use bstr::BString;
use bstr::ByteSlice as _;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A persistent map from slash-separated paths to values, with structural
/// sharing between snapshots. Cloning is O(1); mutation copies only the
/// nodes along the touched path, and grafting a whole subtree (the Subversion
/// directory-copy primitive) is O(path depth).
///
/// Without the sharing, the per-revision filemap snapshots of the Subversion
/// lifter would deep-copy the entire tree every revision and exhaust memory
/// on real histories.
#[derive(Debug)]
pub struct PathMap<V> {
    root: Rc<Node<V>>,
}

#[derive(Debug)]
struct Node<V> {
    files: BTreeMap<BString, V>,
    dirs: BTreeMap<BString, Rc<Node<V>>>,
    /// Number of file entries in this whole subtree.
    count: usize,
}

impl<V> Clone for Node<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        Node {
            files: self.files.clone(),
            dirs: self.dirs.clone(),
            count: self.count,
        }
    }
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Node {
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            count: 0,
        }
    }
}

impl<V> Clone for PathMap<V> {
    fn clone(&self) -> Self {
        PathMap {
            root: self.root.clone(),
        }
    }
}

impl<V> Default for PathMap<V> {
    fn default() -> Self {
        PathMap {
            root: Rc::new(Node::default()),
        }
    }
}

fn split_path(path: &BStr) -> (Vec<&BStr>, &BStr) {
    let mut components: Vec<&BStr> = path
        .split_str(b"/")
        .filter(|c| !c.is_empty())
        .map(|c| c.as_bstr())
        .collect();
    let leaf = components.pop().unwrap_or(b"".as_bstr());
    (components, leaf)
}

fn insert_rec<V: Clone>(node: &mut Rc<Node<V>>, dirs: &[&BStr], leaf: &BStr, value: V) -> bool {
    let node = Rc::make_mut(node);
    let added = match dirs.split_first() {
        None => node.files.insert(leaf.to_owned(), value).is_none(),
        Some((first, rest)) => {
            let child = node.dirs.entry((*first).to_owned()).or_default();
            insert_rec(child, rest, leaf, value)
        }
    };
    if added {
        node.count += 1;
    }
    added
}

fn remove_rec<V: Clone>(node: &mut Rc<Node<V>>, dirs: &[&BStr], leaf: &BStr) -> Option<V> {
    let node = Rc::make_mut(node);
    let removed = match dirs.split_first() {
        None => node.files.remove(leaf),
        Some((first, rest)) => {
            let child = node.dirs.get_mut(*first)?;
            let removed = remove_rec(child, rest, leaf);
            if child.count == 0 {
                node.dirs.remove(*first);
            }
            removed
        }
    };
    if removed.is_some() {
        node.count -= 1;
    }
    removed
}

/// Grafts `subtree` as the directory `dirs/leaf`, replacing whatever was
/// there. Returns the change in entry count.
fn graft_rec<V: Clone>(
    node: &mut Rc<Node<V>>,
    dirs: &[&BStr],
    leaf: &BStr,
    subtree: Rc<Node<V>>,
) -> isize {
    let node = Rc::make_mut(node);
    let delta = match dirs.split_first() {
        None => {
            let prev = node.dirs.insert(leaf.to_owned(), subtree.clone());
            subtree.count as isize - prev.map_or(0, |p| p.count as isize)
        }
        Some((first, rest)) => {
            let child = node.dirs.entry((*first).to_owned()).or_default();
            graft_rec(child, rest, leaf, subtree)
        }
    };
    node.count = (node.count as isize + delta) as usize;
    delta
}

fn remove_dir_rec<V: Clone>(node: &mut Rc<Node<V>>, dirs: &[&BStr], leaf: &BStr) -> usize {
    let node = Rc::make_mut(node);
    let removed = match dirs.split_first() {
        None => node.dirs.remove(leaf).map_or(0, |sub| sub.count),
        Some((first, rest)) => {
            let Some(child) = node.dirs.get_mut(*first) else {
                return 0;
            };
            let removed = remove_dir_rec(child, rest, leaf);
            if child.count == 0 {
                node.dirs.remove(*first);
            }
            removed
        }
    };
    node.count -= removed;
    removed
}

impl<V: Clone> PathMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.root.count
    }

    pub fn is_empty(&self) -> bool {
        self.root.count == 0
    }

    pub fn get(&self, path: &BStr) -> Option<&V> {
        let (dirs, leaf) = split_path(path);
        let mut node = &self.root;
        for dir in dirs {
            node = node.dirs.get(dir)?;
        }
        node.files.get(leaf)
    }

    pub fn contains(&self, path: &BStr) -> bool {
        self.get(path).is_some()
    }

    pub fn insert(&mut self, path: &BStr, value: V) {
        let (dirs, leaf) = split_path(path);
        insert_rec(&mut self.root, &dirs, leaf, value);
    }

    pub fn remove(&mut self, path: &BStr) -> Option<V> {
        let (dirs, leaf) = split_path(path);
        remove_rec(&mut self.root, &dirs, leaf)
    }

    fn subtree_node(&self, prefix: &BStr) -> Option<&Rc<Node<V>>> {
        let mut node = &self.root;
        for dir in prefix
            .split_str(b"/")
            .filter(|c| !c.is_empty())
            .map(|c| c.as_bstr())
        {
            node = node.dirs.get(dir)?;
        }
        Some(node)
    }

    /// Number of file entries at or below `prefix`.
    pub fn count_under(&self, prefix: &BStr) -> usize {
        if prefix.is_empty() {
            return self.len();
        }
        let direct_file = usize::from(self.get(prefix).is_some());
        let subtree = self.subtree_node(prefix).map_or(0, |node| node.count);
        direct_file + subtree
    }

    /// Copies the subtree rooted at `from` in `source` onto `to` in self,
    /// sharing the source nodes. Single-file sources degenerate to a plain
    /// insert. This is the Subversion copyfrom primitive: the source snapshot
    /// is the filemap at the copy's source revision, not the current one.
    pub fn overlay_from(&mut self, source: &PathMap<V>, from: &BStr, to: &BStr) {
        if let Some(value) = source.get(from).cloned() {
            self.insert(to, value);
        }
        let Some(source_node) = source.subtree_node(from) else {
            return;
        };
        if source_node.count == 0 {
            return;
        }
        if to.is_empty() {
            // Copy onto the root: graft the source children wholesale.
            let root = Rc::make_mut(&mut self.root);
            for (name, child) in &source_node.dirs {
                root.count += child.count;
                if let Some(prev) = root.dirs.insert(name.clone(), child.clone()) {
                    root.count -= prev.count;
                }
            }
            for (name, value) in &source_node.files {
                if root.files.insert(name.clone(), value.clone()).is_none() {
                    root.count += 1;
                }
            }
            return;
        }
        let (dirs, leaf) = split_path(to);
        graft_rec(&mut self.root, &dirs, leaf, source_node.clone());
    }

    /// Grafts the subtree rooted at `from` onto `to` within the same map.
    pub fn copy_subtree(&mut self, from: &BStr, to: &BStr) {
        let source = self.clone();
        self.overlay_from(&source, from, to);
    }

    /// Removes the file at `prefix` and everything below it. Returns the
    /// number of removed entries.
    pub fn delete_subtree(&mut self, prefix: &BStr) -> usize {
        let mut removed = 0;
        if self.remove(prefix).is_some() {
            removed += 1;
        }
        let (dirs, leaf) = split_path(prefix);
        removed += remove_dir_rec(&mut self.root, &dirs, leaf);
        removed
    }

    /// All `(path, value)` entries in lexicographic path order.
    pub fn entries(&self) -> Vec<(BString, V)> {
        collect_entries(&self.root)
    }

    /// All `(path, value)` entries at or under `prefix`, with paths reported
    /// relative to the map root.
    pub fn entries_under(&self, prefix: &BStr) -> Vec<(BString, V)> {
        if prefix.is_empty() {
            return self.entries();
        }
        let mut out = Vec::new();
        if let Some(value) = self.get(prefix) {
            out.push((prefix.to_owned(), value.clone()));
        }
        if let Some(node) = self.subtree_node(prefix) {
            for (rel, value) in collect_entries(node) {
                let mut path = prefix.to_owned();
                path.extend_from_slice(b"/");
                path.extend_from_slice(&rel);
                out.push((path, value));
            }
        }
        out
    }

    pub fn paths(&self) -> Vec<BString> {
        self.entries().into_iter().map(|(p, _)| p).collect()
    }
}

fn collect_entries<V: Clone>(node: &Node<V>) -> Vec<(BString, V)> {
    fn walk<V: Clone>(node: &Node<V>, prefix: &mut BString, out: &mut Vec<(BString, V)>) {
        for (name, value) in &node.files {
            let mut path = prefix.clone();
            path.extend_from_slice(name);
            out.push((path, value.clone()));
        }
        for (name, child) in &node.dirs {
            let saved = prefix.len();
            prefix.extend_from_slice(name);
            prefix.extend_from_slice(b"/");
            walk(child, prefix, out);
            prefix.truncate(saved);
        }
    }
    let mut out = Vec::new();
    walk(node, &mut BString::from(""), &mut out);
    out.sort_by(|(a, _), (b, _)| a.cmp(b));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::B;

    fn map_of(entries: &[(&str, i32)]) -> PathMap<i32> {
        let mut map = PathMap::new();
        for (path, value) in entries {
            map.insert(path.as_bytes().as_bstr(), *value);
        }
        map
    }

    #[test]
    fn test_insert_get_remove() {
        let mut map = map_of(&[("trunk/a.txt", 1), ("trunk/sub/b.txt", 2)]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(B("trunk/a.txt").as_bstr()), Some(&1));
        assert_eq!(map.get(B("trunk/sub/b.txt").as_bstr()), Some(&2));
        assert_eq!(map.get(B("trunk/missing").as_bstr()), None);
        assert_eq!(map.remove(B("trunk/a.txt").as_bstr()), Some(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(B("trunk/a.txt").as_bstr()), None);
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let mut map = map_of(&[("a", 1)]);
        map.insert(B("a").as_bstr(), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(B("a").as_bstr()), Some(&2));
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut map = map_of(&[("trunk/a", 1), ("trunk/b", 2)]);
        let snapshot = map.clone();
        map.insert(B("trunk/c").as_bstr(), 3);
        map.remove(B("trunk/a").as_bstr());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(B("trunk/a").as_bstr()), Some(&1));
        assert_eq!(snapshot.get(B("trunk/c").as_bstr()), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_copy_subtree_shares_structure() {
        let mut map = map_of(&[("trunk/x/a", 1), ("trunk/x/b", 2), ("trunk/y", 3)]);
        map.copy_subtree(B("trunk").as_bstr(), B("branches/dev").as_bstr());
        assert_eq!(map.get(B("branches/dev/x/a").as_bstr()), Some(&1));
        assert_eq!(map.get(B("branches/dev/y").as_bstr()), Some(&3));
        assert_eq!(map.len(), 6);
        // The source is untouched.
        assert_eq!(map.get(B("trunk/x/b").as_bstr()), Some(&2));
    }

    #[test]
    fn test_overlay_from_source_revision() {
        let mut old = map_of(&[("trunk/a", 1)]);
        let snapshot = old.clone();
        old.insert(B("trunk/b").as_bstr(), 2);
        let mut current = old.clone();
        // Copy from the snapshot, not from the current map.
        current.overlay_from(&snapshot, B("trunk").as_bstr(), B("tags/v1").as_bstr());
        assert_eq!(current.get(B("tags/v1/a").as_bstr()), Some(&1));
        assert_eq!(current.get(B("tags/v1/b").as_bstr()), None);
        assert_eq!(current.get(B("trunk/b").as_bstr()), Some(&2));
    }

    #[test]
    fn test_overlay_replaces_previous_target() {
        let source = map_of(&[("trunk/a", 1)]);
        let mut map = map_of(&[("tags/v1/stale", 9), ("other", 8)]);
        map.overlay_from(&source, B("trunk").as_bstr(), B("tags/v1").as_bstr());
        assert_eq!(map.get(B("tags/v1/a").as_bstr()), Some(&1));
        assert_eq!(map.get(B("tags/v1/stale").as_bstr()), None);
        assert_eq!(map.get(B("other").as_bstr()), Some(&8));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_single_file_copy() {
        let mut map = map_of(&[("trunk/a", 1)]);
        map.copy_subtree(B("trunk/a").as_bstr(), B("tags/a").as_bstr());
        assert_eq!(map.get(B("tags/a").as_bstr()), Some(&1));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_delete_subtree() {
        let mut map = map_of(&[("branches/dead/a", 1), ("branches/dead/b/c", 2), ("keep", 3)]);
        let removed = map.delete_subtree(B("branches/dead").as_bstr());
        assert_eq!(removed, 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(B("keep").as_bstr()), Some(&3));
    }

    #[test]
    fn test_entries_order() {
        let map = map_of(&[("b", 2), ("a/z", 1), ("a/c/d", 4)]);
        let paths: Vec<_> = map.paths().into_iter().collect();
        assert_eq!(
            paths,
            vec![BString::from("a/c/d"), BString::from("a/z"), BString::from("b")]
        );
    }

    #[test]
    fn test_entries_under() {
        let map = map_of(&[("trunk/a", 1), ("trunk/b/c", 2), ("branches/x", 3)]);
        let under: Vec<_> = map
            .entries_under(B("trunk").as_bstr())
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(under, vec![BString::from("trunk/a"), BString::from("trunk/b/c")]);
    }

    #[test]
    fn test_count_under() {
        let map = map_of(&[("trunk/a", 1), ("trunk/b/c", 2), ("branches/x", 3)]);
        assert_eq!(map.count_under(B("trunk").as_bstr()), 2);
        assert_eq!(map.count_under(B("").as_bstr()), 3);
        assert_eq!(map.count_under(B("nothing").as_bstr()), 0);
    }
}
