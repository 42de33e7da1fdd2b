//! Schema-driven weight table.
//!
//! The table is built once from an introspected schema and consulted by the
//! analyzer on every request. Each named output type maps to a base weight
//! and a descriptor per field; list fields bounded by a slicing argument
//! carry a [`SliceRule`] that resolves the list's declared upper bound from
//! the query's arguments and variables.

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use async_graphql::parser::types::{
    BaseType, FieldDefinition, ServiceDocument, Type, TypeDefinition, TypeKind,
    TypeSystemDefinition,
};
use async_graphql::{Name, Positioned, Variables};
use async_graphql_value::{ConstValue, Value};
use std::collections::HashMap;

/// Built-in scalars are not declared in SDL but lists of them still need a
/// resolvable element entry.
const BUILTIN_SCALARS: [&str; 5] = ["int", "float", "string", "boolean", "id"];

/// Immutable per-schema weight table, keyed by lowercased type name. Root
/// operation types are additionally keyed by their operation kind
/// (`query`, `mutation`, `subscription`).
#[derive(Debug, Clone)]
pub struct WeightTable {
    types: HashMap<String, TypeWeight>,
}

#[derive(Debug, Clone)]
pub struct TypeWeight {
    pub weight: u64,
    pub fields: HashMap<String, FieldWeight>,
}

/// Per-field descriptor.
#[derive(Debug, Clone)]
pub enum FieldWeight {
    /// Scalar or enum leaf; the value is the configured scalar weight.
    Leaf(u64),
    /// Object, interface or union reference, by lowercased type name.
    Ref(String),
    /// List of `element`, bounded by `rule`.
    List { element: String, rule: SliceRule },
}

/// Resolves a bounded list's cardinality from the field's AST arguments and
/// the request variables. Pure; holds no schema references.
#[derive(Debug, Clone)]
pub struct SliceRule {
    /// Slicing argument name, or `None` for a list with no declared bound.
    pub argument: Option<String>,
    /// Schema-declared default of the slicing argument.
    pub schema_default: Option<u64>,
    /// Configured sentinel used when nothing else resolves.
    pub fallback: u64,
}

impl SliceRule {
    /// The list's effective upper bound: the argument's literal value, the
    /// referenced variable's value, the schema default, or the fallback, in
    /// that order. `variables` is expected to already contain the
    /// operation's variable-definition defaults.
    pub fn multiplier(
        &self,
        arguments: &[(Positioned<Name>, Positioned<Value>)],
        variables: &Variables,
    ) -> GateResult<u64> {
        let Some(argument) = self.argument.as_deref() else {
            return Ok(self.fallback);
        };

        let supplied = arguments
            .iter()
            .find(|(name, _)| name.node.as_str() == argument)
            .map(|(_, value)| &value.node);

        match supplied {
            None => Ok(self.schema_default.unwrap_or(self.fallback)),
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                GateError::Analysis(format!(
                    "slicing argument {} must be a non-negative integer, got {}",
                    argument, n
                ))
            }),
            Some(Value::Variable(var)) => match variables.get(var.as_str()) {
                Some(ConstValue::Number(n)) => n.as_u64().ok_or_else(|| {
                    GateError::Analysis(format!(
                        "variable ${} for slicing argument {} must be a non-negative integer, got {}",
                        var, argument, n
                    ))
                }),
                Some(ConstValue::Null) | None => {
                    Ok(self.schema_default.unwrap_or(self.fallback))
                }
                Some(other) => Err(GateError::Analysis(format!(
                    "variable ${} for slicing argument {} must be an integer, got {}",
                    var, argument, other
                ))),
            },
            Some(other) => Err(GateError::Analysis(format!(
                "slicing argument {} must be an integer, got {}",
                argument, other
            ))),
        }
    }
}

/// Kind summary kept from the first pass so field classification does not
/// re-walk type definitions.
#[derive(Clone, Copy, PartialEq)]
enum TypeClass {
    Leaf,
    Composite,
}

impl WeightTable {
    /// Walk the schema once and produce the table. Fatal on unresolved type
    /// references, on malformed slicing-argument defaults, and on unbounded
    /// lists when `enforceBoundedLists` is set.
    pub fn build(schema: &ServiceDocument, config: &GateConfig) -> GateResult<Self> {
        let weights = &config.type_weights;

        let mut query_root = "Query".to_string();
        let mut mutation_root = "Mutation".to_string();
        let mut subscription_root = "Subscription".to_string();
        let mut definitions: Vec<&TypeDefinition> = Vec::new();

        for definition in &schema.definitions {
            match definition {
                TypeSystemDefinition::Schema(node) => {
                    if let Some(name) = &node.node.query {
                        query_root = name.node.to_string();
                    }
                    if let Some(name) = &node.node.mutation {
                        mutation_root = name.node.to_string();
                    }
                    if let Some(name) = &node.node.subscription {
                        subscription_root = name.node.to_string();
                    }
                }
                TypeSystemDefinition::Type(node) => {
                    if !node.node.name.node.starts_with("__") {
                        definitions.push(&node.node);
                    }
                }
                TypeSystemDefinition::Directive(_) => {}
            }
        }

        let mut types: HashMap<String, TypeWeight> = HashMap::new();
        let mut classes: HashMap<String, TypeClass> = HashMap::new();

        for builtin in BUILTIN_SCALARS {
            types.insert(
                builtin.to_string(),
                TypeWeight { weight: weights.scalar, fields: HashMap::new() },
            );
            classes.insert(builtin.to_string(), TypeClass::Leaf);
        }

        // First pass: base weights per kind.
        for definition in &definitions {
            let name = definition.name.node.as_str();
            let key = name.to_lowercase();
            let (weight, class) = match &definition.kind {
                TypeKind::Scalar | TypeKind::Enum(_) => (weights.scalar, TypeClass::Leaf),
                TypeKind::Union(_) => (weights.object, TypeClass::Composite),
                TypeKind::Object(_) | TypeKind::Interface(_) => {
                    let weight = if name == mutation_root {
                        weights.mutation
                    } else if is_connection(name, definition) {
                        weights.connection
                    } else {
                        weights.object
                    };
                    (weight, TypeClass::Composite)
                }
                TypeKind::InputObject(_) => continue,
            };
            types.insert(key.clone(), TypeWeight { weight, fields: HashMap::new() });
            classes.insert(key, class);
        }

        // Second pass: field descriptors, now that every target is known.
        for definition in &definitions {
            let fields = match &definition.kind {
                TypeKind::Object(object) => &object.fields,
                TypeKind::Interface(interface) => &interface.fields,
                _ => continue,
            };

            let type_name = definition.name.node.as_str();
            let key = type_name.to_lowercase();
            let mut descriptors = HashMap::new();

            for field in fields {
                let field_name = field.node.name.node.as_str();
                let descriptor =
                    classify_field(&field.node, type_name, config, &classes)?;
                descriptors.insert(field_name.to_lowercase(), descriptor);
            }

            if let Some(entry) = types.get_mut(&key) {
                entry.fields = descriptors;
            }
        }

        // Root operation types are reachable by operation kind as well.
        let roots = [
            ("query", query_root),
            ("mutation", mutation_root),
            ("subscription", subscription_root),
        ];
        for (kind, root_name) in roots {
            let root_key = root_name.to_lowercase();
            if root_key != kind {
                if let Some(entry) = types.get(&root_key).cloned() {
                    types.insert(kind.to_string(), entry);
                }
            }
        }

        Ok(Self { types })
    }

    pub fn get(&self, name: &str) -> Option<&TypeWeight> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn classify_field(
    field: &FieldDefinition,
    type_name: &str,
    config: &GateConfig,
    classes: &HashMap<String, TypeClass>,
) -> GateResult<FieldWeight> {
    let (is_list, target) = unwrap_type(&field.ty.node);
    let target_key = target.to_lowercase();
    let Some(class) = classes.get(&target_key).copied() else {
        return Err(GateError::Schema(format!(
            "field {}.{} references unresolved type {}",
            type_name, field.name.node, target
        )));
    };

    if is_list {
        let slicing = config
            .slicing_arguments
            .iter()
            .find_map(|name| {
                field
                    .arguments
                    .iter()
                    .find(|arg| arg.node.name.node.as_str() == name)
            })
            .map(|arg| &arg.node);

        let rule = match slicing {
            Some(arg) => SliceRule {
                argument: Some(arg.name.node.to_string()),
                schema_default: argument_default(arg.default_value.as_ref(), type_name, field)?,
                fallback: config.default_list_size,
            },
            None if config.enforce_bounded_lists => {
                return Err(GateError::Schema(format!(
                    "list field {}.{} has no slicing argument",
                    type_name, field.name.node
                )));
            }
            None => SliceRule {
                argument: None,
                schema_default: None,
                fallback: config.default_list_size,
            },
        };

        return Ok(FieldWeight::List { element: target_key, rule });
    }

    match class {
        TypeClass::Leaf => Ok(FieldWeight::Leaf(config.type_weights.scalar)),
        TypeClass::Composite => Ok(FieldWeight::Ref(target_key)),
    }
}

fn argument_default(
    default: Option<&Positioned<ConstValue>>,
    type_name: &str,
    field: &FieldDefinition,
) -> GateResult<Option<u64>> {
    match default.map(|value| &value.node) {
        None | Some(ConstValue::Null) => Ok(None),
        Some(ConstValue::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            GateError::Schema(format!(
                "slicing default on {}.{} must be a non-negative integer, got {}",
                type_name, field.name.node, n
            ))
        }),
        Some(other) => Err(GateError::Schema(format!(
            "slicing default on {}.{} must be an integer, got {}",
            type_name, field.name.node, other
        ))),
    }
}

/// Strip non-null and list wrappers down to the innermost named type.
fn unwrap_type(ty: &Type) -> (bool, &Name) {
    match &ty.base {
        BaseType::Named(name) => (false, name),
        BaseType::List(inner) => (true, innermost_name(inner)),
    }
}

fn innermost_name(ty: &Type) -> &Name {
    match &ty.base {
        BaseType::Named(name) => name,
        BaseType::List(inner) => innermost_name(inner),
    }
}

/// Relay connection pattern: a `Connection` name suffix, or an `edges` +
/// `pageInfo` field pair.
fn is_connection(name: &str, definition: &TypeDefinition) -> bool {
    if name.ends_with("Connection") {
        return true;
    }
    let fields = match &definition.kind {
        TypeKind::Object(object) => &object.fields,
        TypeKind::Interface(interface) => &interface.fields,
        _ => return false,
    };
    let has = |wanted: &str| fields.iter().any(|f| f.node.name.node.as_str() == wanted);
    has("edges") && has("pageInfo")
}
