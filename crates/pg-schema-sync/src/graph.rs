//! Foreign-key dependency graph over tables.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::warn;

use crate::core::ForeignKey;

/// Result of ordering tables by their foreign-key dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOrder {
    /// Every table exactly once; referenced tables before referencing ones
    /// unless they sit on a cycle.
    pub order: Vec<String>,
    /// Tables that could not be ordered, sorted by name.
    pub cyclic: Vec<String>,
}

/// Parent -> children edges ("referenced by"), deduplicated per table pair.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    children: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph over `tables`. Self references and references to
    /// tables outside the set are ignored.
    pub fn build<'a, I, F>(tables: I, foreign_keys: F) -> Self
    where
        I: IntoIterator<Item = &'a String>,
        F: IntoIterator<Item = &'a ForeignKey>,
    {
        let nodes: BTreeSet<String> = tables.into_iter().cloned().collect();
        let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for fk in foreign_keys {
            if fk.table == fk.ref_table
                || !nodes.contains(&fk.table)
                || !nodes.contains(&fk.ref_table)
            {
                continue;
            }
            children
                .entry(fk.ref_table.clone())
                .or_default()
                .insert(fk.table.clone());
        }

        Self { nodes, children }
    }

    /// Kahn's algorithm with alphabetical tie-breaks.
    ///
    /// Tables left over when the queue drains are on (or behind) a cycle;
    /// they are appended in name order and reported with a warning.
    pub fn topological_order(&self) -> TableOrder {
        let mut in_degree: BTreeMap<&str, usize> =
            self.nodes.iter().map(|n| (n.as_str(), 0)).collect();
        for kids in self.children.values() {
            for child in kids {
                if let Some(d) = in_degree.get_mut(child.as_str()) {
                    *d += 1;
                }
            }
        }

        // BTreeMap iteration is already sorted by name.
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order: Vec<String> = Vec::with_capacity(self.nodes.len());
        while let Some(table) = queue.pop_front() {
            order.push(table.to_string());
            let mut released = Vec::new();
            if let Some(kids) = self.children.get(table) {
                for child in kids {
                    if let Some(d) = in_degree.get_mut(child.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            released.push(child.as_str());
                        }
                    }
                }
            }
            released.sort_unstable();
            queue.extend(released);
        }

        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let cyclic: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !placed.contains(n.as_str()))
            .cloned()
            .collect();

        if !cyclic.is_empty() {
            warn!(
                "Foreign key cycle detected; appending {} table(s) in name order: {}",
                cyclic.len(),
                cyclic.join(", ")
            );
            order.extend(cyclic.iter().cloned());
        }

        TableOrder { order, cyclic }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ReferentialAction;

    fn fk(table: &str, cols: &[&str], ref_table: &str) -> ForeignKey {
        ForeignKey::new(
            format!("{}_{}_fk", table, ref_table),
            table,
            cols.iter().map(|c| c.to_string()).collect(),
            ref_table,
            cols.iter().map(|_| "id".to_string()).collect(),
            ReferentialAction::NoAction,
            ReferentialAction::NoAction,
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_parents_before_children() {
        let tables = names(&["order_items", "orders", "products", "users"]);
        let fks = vec![
            fk("orders", &["user_id"], "users"),
            fk("order_items", &["order_id"], "orders"),
            fk("order_items", &["product_id"], "products"),
        ];
        let result = DependencyGraph::build(&tables, &fks).topological_order();
        assert!(result.cyclic.is_empty());
        assert_eq!(result.order, names(&["products", "users", "orders", "order_items"]));
        for f in &fks {
            assert!(position(&result.order, &f.ref_table) < position(&result.order, &f.table));
        }
    }

    #[test]
    fn test_alphabetical_tie_break() {
        let tables = names(&["zeta", "alpha", "mid"]);
        let result = DependencyGraph::build(&tables, &[]).topological_order();
        assert_eq!(result.order, names(&["alpha", "mid", "zeta"]));
    }

    #[test]
    fn test_composite_fk_counted_once() {
        let tables = names(&["parent", "child"]);
        let fks = vec![
            fk("child", &["a", "b"], "parent"),
            fk("child", &["c"], "parent"),
        ];
        let graph = DependencyGraph::build(&tables, &fks);
        assert_eq!(graph.children["parent"].len(), 1);
        let result = graph.topological_order();
        assert_eq!(result.order, names(&["parent", "child"]));
    }

    #[test]
    fn test_self_reference_ignored() {
        let tables = names(&["employees"]);
        let fks = vec![fk("employees", &["manager_id"], "employees")];
        let result = DependencyGraph::build(&tables, &fks).topological_order();
        assert_eq!(result.order, names(&["employees"]));
        assert!(result.cyclic.is_empty());
    }

    #[test]
    fn test_unknown_reference_ignored() {
        let tables = names(&["orders"]);
        let fks = vec![fk("orders", &["user_id"], "users")];
        let result = DependencyGraph::build(&tables, &fks).topological_order();
        assert_eq!(result.order, names(&["orders"]));
    }

    #[test]
    fn test_cycle_appended_in_name_order() {
        let tables = names(&["a", "b", "c", "root"]);
        let fks = vec![
            fk("b", &["a_id"], "a"),
            fk("a", &["c_id"], "c"),
            fk("c", &["b_id"], "b"),
        ];
        let result = DependencyGraph::build(&tables, &fks).topological_order();
        assert_eq!(result.cyclic, names(&["a", "b", "c"]));
        assert_eq!(result.order, names(&["root", "a", "b", "c"]));
    }

    #[test]
    fn test_every_table_once_with_cycle() {
        let tables = names(&["a", "b", "leaf"]);
        let fks = vec![
            fk("a", &["b_id"], "b"),
            fk("b", &["a_id"], "a"),
            fk("leaf", &["a_id"], "a"),
        ];
        let result = DependencyGraph::build(&tables, &fks).topological_order();
        let mut sorted = result.order.clone();
        sorted.sort();
        assert_eq!(sorted, names(&["a", "b", "leaf"]));
    }
}
