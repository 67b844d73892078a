//! Density-based clustering (HDBSCAN) for paragraph embeddings.
//!
//! Uses `min_samples = 1`, where mutual reachability equals plain Euclidean
//! distance, so the hierarchy is the single-linkage tree over the minimum
//! spanning tree. Flat clusters are picked by excess of mass and the root is
//! never selected, so a dataset with no real split is all noise.

use std::collections::HashMap;

pub struct Hdbscan {
    min_cluster_size: usize,
}

impl Hdbscan {
    pub fn new(min_cluster_size: usize) -> Self {
        Self {
            min_cluster_size: min_cluster_size.max(2),
        }
    }

    /// One label per point; `None` is noise. Labels are numbered in order of
    /// the first point that carries them.
    pub fn fit(&self, points: &[Vec<f32>]) -> Vec<Option<usize>> {
        let n = points.len();
        if n < 2 {
            return vec![None; n];
        }
        let mst = minimum_spanning_tree(points);
        let tree = Dendrogram::from_mst(n, mst);
        let clusters = condense(&tree, self.min_cluster_size);
        let selected = select_eom(&clusters);
        assign_labels(&clusters, &selected, n)
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Prim's algorithm over the dense distance matrix.
fn minimum_spanning_tree(points: &[Vec<f32>]) -> Vec<(usize, usize, f64)> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut nearest = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[current] = true;
    for _ in 1..n {
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let d = euclidean(&points[current], &points[j]);
            if d < best[j] {
                best[j] = d;
                nearest[j] = current;
            }
        }
        let Some(next) = (0..n)
            .filter(|&j| !in_tree[j])
            .min_by(|&a, &b| best[a].total_cmp(&best[b]))
        else {
            break;
        };
        in_tree[next] = true;
        edges.push((nearest[next], next, best[next]));
        current = next;
    }
    edges
}

/// Single-linkage merge tree. Leaves are `0..n`; merge `i` is node `n + i`.
struct Dendrogram {
    n: usize,
    children: Vec<(usize, usize)>,
    distance: Vec<f64>,
    size: Vec<usize>,
}

impl Dendrogram {
    fn from_mst(n: usize, mut edges: Vec<(usize, usize, f64)>) -> Self {
        edges.sort_by(|a, b| a.2.total_cmp(&b.2));

        let mut parent: Vec<usize> = (0..n).collect();
        let mut top: Vec<usize> = (0..n).collect();
        let mut tree = Self {
            n,
            children: Vec::with_capacity(edges.len()),
            distance: Vec::with_capacity(edges.len()),
            size: Vec::with_capacity(edges.len()),
        };

        for (a, b, d) in edges {
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            if ra == rb {
                continue;
            }
            let (left, right) = (top[ra], top[rb]);
            let size = tree.size_of(left) + tree.size_of(right);
            let node = n + tree.children.len();
            tree.children.push((left, right));
            tree.distance.push(d);
            tree.size.push(size);
            parent[rb] = ra;
            top[ra] = node;
        }
        tree
    }

    fn root(&self) -> usize {
        self.n + self.children.len() - 1
    }

    fn size_of(&self, node: usize) -> usize {
        if node < self.n {
            1
        } else {
            self.size[node - self.n]
        }
    }

    fn leaves(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if node < self.n {
                out.push(node);
            } else {
                let (l, r) = self.children[node - self.n];
                stack.push(l);
                stack.push(r);
            }
        }
        out
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

fn lambda(distance: f64) -> f64 {
    if distance > 1e-9 {
        1.0 / distance
    } else {
        1e9
    }
}

#[derive(Debug)]
struct CondensedCluster {
    parent: Option<usize>,
    birth: f64,
    size: usize,
    children: Vec<usize>,
    /// Points that leave this cluster directly, with the lambda they leave at.
    points: Vec<(usize, f64)>,
}

impl CondensedCluster {
    fn new(parent: Option<usize>, birth: f64, size: usize) -> Self {
        Self {
            parent,
            birth,
            size,
            children: Vec::new(),
            points: Vec::new(),
        }
    }
}

/// Walk the merge tree top-down, keeping only splits where both sides have
/// at least `min_cluster_size` points. Child ids are always greater than
/// their parent's.
fn condense(tree: &Dendrogram, min_cluster_size: usize) -> Vec<CondensedCluster> {
    let root = tree.root();
    let mut clusters = vec![CondensedCluster::new(None, 0.0, tree.size_of(root))];
    let mut stack = vec![(root, 0usize)];

    while let Some((node, cid)) = stack.pop() {
        if node < tree.n {
            let birth = clusters[cid].birth;
            clusters[cid].points.push((node, birth));
            continue;
        }
        let i = node - tree.n;
        let (left, right) = tree.children[i];
        let l = lambda(tree.distance[i]);
        let left_big = tree.size_of(left) >= min_cluster_size;
        let right_big = tree.size_of(right) >= min_cluster_size;

        match (left_big, right_big) {
            (true, true) => {
                for child in [left, right] {
                    let id = clusters.len();
                    clusters.push(CondensedCluster::new(Some(cid), l, tree.size_of(child)));
                    clusters[cid].children.push(id);
                    stack.push((child, id));
                }
            }
            (true, false) => {
                fall_out(tree, right, l, &mut clusters[cid]);
                stack.push((left, cid));
            }
            (false, true) => {
                fall_out(tree, left, l, &mut clusters[cid]);
                stack.push((right, cid));
            }
            (false, false) => {
                fall_out(tree, left, l, &mut clusters[cid]);
                fall_out(tree, right, l, &mut clusters[cid]);
            }
        }
    }
    clusters
}

fn fall_out(tree: &Dendrogram, node: usize, lambda: f64, cluster: &mut CondensedCluster) {
    for p in tree.leaves(node) {
        cluster.points.push((p, lambda));
    }
}

fn stability(clusters: &[CondensedCluster], id: usize) -> f64 {
    let c = &clusters[id];
    let from_points: f64 = c.points.iter().map(|(_, l)| l - c.birth).sum();
    let from_children: f64 = c
        .children
        .iter()
        .map(|&k| clusters[k].size as f64 * (clusters[k].birth - c.birth))
        .sum();
    from_points + from_children
}

/// Excess-of-mass selection, bottom-up. The root (id 0) is never selected.
fn select_eom(clusters: &[CondensedCluster]) -> Vec<bool> {
    let m = clusters.len();
    let mut selected = vec![false; m];
    let mut subtree = vec![0.0f64; m];

    for id in (1..m).rev() {
        let own = stability(clusters, id);
        let below: f64 = clusters[id].children.iter().map(|&k| subtree[k]).sum();
        if clusters[id].children.is_empty() || own >= below {
            selected[id] = true;
            subtree[id] = own;
            let mut stack = clusters[id].children.clone();
            while let Some(k) = stack.pop() {
                selected[k] = false;
                stack.extend_from_slice(&clusters[k].children);
            }
        } else {
            subtree[id] = below;
        }
    }
    selected
}

fn assign_labels(clusters: &[CondensedCluster], selected: &[bool], n: usize) -> Vec<Option<usize>> {
    let mut home = vec![0usize; n];
    for (cid, c) in clusters.iter().enumerate() {
        for &(p, _) in &c.points {
            home[p] = cid;
        }
    }

    let mut renumber: HashMap<usize, usize> = HashMap::new();
    let mut labels = vec![None; n];
    for (p, label) in labels.iter_mut().enumerate() {
        let mut c = home[p];
        loop {
            if selected[c] {
                let next = renumber.len();
                *label = Some(*renumber.entry(c).or_insert(next));
                break;
            }
            match clusters[c].parent {
                Some(parent) => c = parent,
                None => break,
            }
        }
    }
    labels
}
