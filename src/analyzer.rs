//! Static query-cost analysis.
//!
//! [`analyze`] walks a parsed query against the weight table and produces
//! its complexity: every object selection costs its type weight, and bounded
//! list fields multiply the cost of one element by the list's resolved upper
//! bound. The walk is pure and deterministic; the same document, variables
//! and table always yield the same integer.

use crate::error::{GateError, GateResult};
use crate::weights::{FieldWeight, WeightTable};
use async_graphql::parser::types::{
    ExecutableDocument, Field, OperationDefinition, OperationType, Selection, SelectionSet,
};
use async_graphql::Variables;
use tracing::debug;

/// Hard ceiling on selection nesting, independent of the configured depth
/// limit. Keeps hostile documents from exhausting the stack.
const MAX_RECURSION_DEPTH: u32 = 256;

/// Cost a document against the table. Variables are resolved per operation,
/// with the operation's variable-definition defaults filling any gaps.
pub fn analyze(
    document: &ExecutableDocument,
    variables: &Variables,
    table: &WeightTable,
) -> GateResult<u64> {
    let mut total: u64 = 0;
    for (_name, operation) in document.operations.iter() {
        let cost = operation_cost(&operation.node, variables, table)?;
        total = total
            .checked_add(cost)
            .ok_or_else(|| GateError::Analysis("complexity overflow".to_string()))?;
    }
    Ok(total)
}

/// Maximum selection nesting of the document. Fragment spreads and inline
/// fragments are traversed in place; an unresolvable spread is skipped.
pub fn depth(document: &ExecutableDocument) -> u32 {
    let mut deepest = 0;
    for (_name, operation) in document.operations.iter() {
        let mut next_level: Vec<&Selection> = Vec::new();
        let mut curr_level: Vec<&Selection> = Vec::new();
        let mut levels = 0u32;

        next_level.extend(operation.node.selection_set.node.items.iter().map(|s| &s.node));
        while !next_level.is_empty() {
            levels += 1;
            std::mem::swap(&mut next_level, &mut curr_level);

            for selection in curr_level.drain(..) {
                match selection {
                    Selection::Field(field) => {
                        next_level
                            .extend(field.node.selection_set.node.items.iter().map(|s| &s.node));
                    }
                    Selection::InlineFragment(fragment) => {
                        next_level.extend(
                            fragment.node.selection_set.node.items.iter().map(|s| &s.node),
                        );
                    }
                    Selection::FragmentSpread(spread) => {
                        if let Some(def) =
                            document.fragments.get(&spread.node.fragment_name.node)
                        {
                            next_level.extend(
                                def.node.selection_set.node.items.iter().map(|s| &s.node),
                            );
                        }
                    }
                }
            }
        }

        deepest = deepest.max(levels);
    }
    deepest
}

fn operation_cost(
    operation: &OperationDefinition,
    variables: &Variables,
    table: &WeightTable,
) -> GateResult<u64> {
    let kind = match operation.ty {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    };
    let Some(root) = table.get(kind) else {
        debug!(kind, "operation kind has no root type in the weight table");
        return Ok(0);
    };

    let variables = effective_variables(operation, variables);
    let selections =
        selection_set_cost(&operation.selection_set.node, kind, table, &variables, 1)?;
    checked_add(root.weight, selections)
}

/// Provided variables overlaid on the operation's declared defaults. A
/// variable named like a slicing keyword has no effect unless a field's
/// argument actually references it.
fn effective_variables(operation: &OperationDefinition, variables: &Variables) -> Variables {
    let mut effective = variables.clone();
    for definition in &operation.variable_definitions {
        let name = &definition.node.name.node;
        if !effective.contains_key(name.as_str()) {
            if let Some(default) = &definition.node.default_value {
                effective.insert(name.clone(), default.node.clone());
            }
        }
    }
    effective
}

fn selection_set_cost(
    selection_set: &SelectionSet,
    parent: &str,
    table: &WeightTable,
    variables: &Variables,
    nesting: u32,
) -> GateResult<u64> {
    if nesting > MAX_RECURSION_DEPTH {
        return Err(GateError::Analysis(format!(
            "query nesting exceeds {}",
            MAX_RECURSION_DEPTH
        )));
    }

    let mut cost: u64 = 0;
    for selection in &selection_set.items {
        let contribution = match &selection.node {
            Selection::Field(field) => {
                field_cost(&field.node, parent, table, variables, nesting)?
            }
            // TODO: cost fragment spreads and inline fragments by inlining
            // their selection sets against the fragment's type condition.
            Selection::FragmentSpread(_) | Selection::InlineFragment(_) => 0,
        };
        cost = checked_add(cost, contribution)?;
    }
    Ok(cost)
}

fn field_cost(
    field: &Field,
    parent: &str,
    table: &WeightTable,
    variables: &Variables,
    nesting: u32,
) -> GateResult<u64> {
    let name = field.name.node.to_lowercase();

    // Introspection meta fields resolve without touching the schema.
    if name.starts_with("__") {
        return Ok(0);
    }

    // An object-typed field keyed by its own name.
    if let Some(own) = table.get(&name) {
        let selections =
            selection_set_cost(&field.selection_set.node, &name, table, variables, nesting + 1)?;
        return checked_add(own.weight, selections);
    }

    let parent_type = table.get(parent).ok_or_else(|| {
        GateError::Analysis(format!("unknown type {} while costing field {}", parent, name))
    })?;

    match parent_type.fields.get(&name) {
        Some(FieldWeight::Leaf(weight)) => Ok(*weight),
        Some(FieldWeight::Ref(target)) => {
            let target_type = table.get(target).ok_or_else(|| {
                GateError::Analysis(format!("field {} resolves to unknown type {}", name, target))
            })?;
            let selections = selection_set_cost(
                &field.selection_set.node,
                target,
                table,
                variables,
                nesting + 1,
            )?;
            checked_add(target_type.weight, selections)
        }
        Some(FieldWeight::List { element, rule }) => {
            let multiplier = rule.multiplier(&field.arguments, variables)?;
            let element_type = table.get(element).ok_or_else(|| {
                GateError::Analysis(format!("field {} resolves to unknown type {}", name, element))
            })?;
            let selections = selection_set_cost(
                &field.selection_set.node,
                element,
                table,
                variables,
                nesting + 1,
            )?;
            let per_element = checked_add(element_type.weight, selections)?;
            multiplier
                .checked_mul(per_element)
                .ok_or_else(|| GateError::Analysis("complexity overflow".to_string()))
        }
        None => Err(GateError::Analysis(format!(
            "type {} has no field {}",
            parent, name
        ))),
    }
}

fn checked_add(a: u64, b: u64) -> GateResult<u64> {
    a.checked_add(b)
        .ok_or_else(|| GateError::Analysis("complexity overflow".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use async_graphql::parser::{parse_query, parse_schema};
    use serde_json::json;

    const SDL: &str = r#"
        type Query {
            ok: Boolean
            scalars: Scalars
            reviews(episode: Episode, first: Int = 5): [Review]
            heroes(episode: Episode, first: Int): [Hero]
            human(id: ID!): Human
        }
        type Mutation {
            createReview(episode: Episode): Review
        }
        type Scalars {
            id: ID
            num: Int
            test: Test
        }
        type Test {
            name: String
            scalars: Scalars
        }
        type Review {
            stars: Int
            episode: Episode
        }
        type Hero {
            stars: Int
            episode: Episode
        }
        type Human {
            name: String
            friends(first: Int): [Human]
        }
        enum Episode {
            NEWHOPE
            EMPIRE
            JEDI
        }
    "#;

    fn table() -> WeightTable {
        let schema = parse_schema(SDL).unwrap();
        WeightTable::build(&schema, &GateConfig::default()).unwrap()
    }

    fn cost(query: &str, variables: serde_json::Value) -> GateResult<u64> {
        let doc = parse_query(query).unwrap();
        analyze(&doc, &Variables::from_json(variables), &table())
    }

    #[test]
    fn test_leaf_only_query_costs_the_root_weight() {
        assert_eq!(cost("query { ok }", json!({})).unwrap(), 1);
    }

    #[test]
    fn test_leaf_selection_costs_one_object() {
        assert_eq!(cost("query { scalars { num } }", json!({})).unwrap(), 2);
    }

    #[test]
    fn test_nested_objects() {
        let query = "query { scalars { num, test { name, scalars { id } } } }";
        assert_eq!(cost(query, json!({})).unwrap(), 4);
    }

    #[test]
    fn test_aliases_cost_independently() {
        let query = "query { foo: scalars { num } bar: scalars { id } }";
        assert_eq!(cost(query, json!({})).unwrap(), 3);
    }

    #[test]
    fn test_list_bounded_by_literal_argument() {
        let query = "query { reviews(episode: NEWHOPE, first: 3) { stars, episode } }";
        assert_eq!(cost(query, json!({})).unwrap(), 4);
    }

    #[test]
    fn test_list_bounded_by_schema_default() {
        let query = "query { reviews(episode: NEWHOPE) { stars, episode } }";
        assert_eq!(cost(query, json!({})).unwrap(), 6);
    }

    #[test]
    fn test_variable_wins_over_unrelated_slicing_name() {
        let query =
            "query ($items: Int) { heroes(episode: NEWHOPE, first: $items) { stars, episode } }";
        assert_eq!(cost(query, json!({ "items": 7, "first": 4 })).unwrap(), 8);
    }

    #[test]
    fn test_variable_definition_default_applies() {
        let query = "query ($n: Int = 4) { heroes(first: $n) { stars } }";
        assert_eq!(cost(query, json!({})).unwrap(), 5);
    }

    #[test]
    fn test_nested_lists_multiply() {
        let query = "query { human(id: 1) { name, friends(first: 5) { name, friends(first: 3) { name } } } }";
        assert_eq!(cost(query, json!({})).unwrap(), 22);
    }

    #[test]
    fn test_mutation_composes_like_queries() {
        let query = "mutation { createReview(episode: EMPIRE) { stars } }";
        assert_eq!(cost(query, json!({})).unwrap(), 11);
    }

    #[test]
    fn test_fragment_spreads_cost_nothing() {
        let query = "query { scalars { ...NumOnly } } fragment NumOnly on Scalars { num }";
        assert_eq!(cost(query, json!({})).unwrap(), 2);
    }

    #[test]
    fn test_typename_costs_nothing() {
        assert_eq!(cost("query { scalars { __typename num } }", json!({})).unwrap(), 2);
    }

    #[test]
    fn test_unknown_field_is_structural_error() {
        let err = cost("query { nonexistent }", json!({})).unwrap_err();
        assert!(matches!(err, GateError::Analysis(_)));
    }

    #[test]
    fn test_non_integer_variable_is_error() {
        let query = "query ($n: Int) { heroes(first: $n) { stars } }";
        let err = cost(query, json!({ "n": 2.5 })).unwrap_err();
        assert!(matches!(err, GateError::Analysis(_)));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let query = "query { human(id: 1) { name, friends(first: 5) { name } } }";
        let a = cost(query, json!({})).unwrap();
        let b = cost(query, json!({})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_variables_key_order_is_irrelevant() {
        let query = "query ($a: Int, $b: Int) { heroes(first: $a) { stars } reviews(first: $b) { stars } }";
        let forward = cost(query, json!({ "a": 2, "b": 3 })).unwrap();
        let backward = cost(query, json!({ "b": 3, "a": 2 })).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_depth_counts_selection_levels() {
        let doc = parse_query(
            "query { human(id: 1) { name, friends(first: 5) { name, friends(first: 3) { name } } } }",
        )
        .unwrap();
        assert_eq!(depth(&doc), 4);
    }

    #[test]
    fn test_depth_traverses_fragments() {
        let doc = parse_query(
            "query { scalars { ...Nested } } fragment Nested on Scalars { test { name } }",
        )
        .unwrap();
        assert_eq!(depth(&doc), 4);
    }
}
