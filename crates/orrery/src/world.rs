use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
};

use ahash::{AHashMap, AHashSet};
use log::{debug, trace};

use crate::{
    builtins,
    cache::ObjectCache,
    error::{Error, EvalResult},
    eval::eval_parsing,
    object::{
        BuiltinFunction, DataSeries, GlobalConstant, MathObject, ObjectKind, Parsing, ReprKind,
        Sequence, UserFunction,
    },
    parse::{
        Ast, AstNode, DepInfo, Deps, build_ast, build_ast_at, direct_dependencies, is_valid_name,
        mark_input_vars, split_top_level, tokenize, top_level_indices,
    },
    resolve::bind,
    slot::{SlotId, SlotVec},
    token::{SourceText, Token, TokenKind},
};

/// Default cross-object recursion budget.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 100;

/// Tunables fixed at registry construction.
#[derive(Debug, Clone, Copy)]
pub struct WorldConfig {
    /// Maximum number of cross-object descents one evaluation may make.
    pub max_recursion_depth: usize,
    /// Buffer size of each sequence's and data series' value cache.
    pub cache_size: usize,
    /// Representation right-hand sides are stored and evaluated in.
    pub repr: ReprKind,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            cache_size: crate::cache::DEFAULT_CACHE_SIZE,
            repr: ReprKind::default(),
        }
    }
}

/// Returned when an erase targets an object that is not in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisteredObject;

impl fmt::Display for UnregisteredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object is not registered in this world")
    }
}

impl std::error::Error for UnregisteredObject {}

/// One registry slot: the object's name, its defining equation (when it
/// came from one), a revision stamp, and either a live definition or the
/// error that broke it. A broken entry keeps its name, slot, and
/// recorded dependencies so later mutations can revive it.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) name: String,
    pub(crate) source: Option<String>,
    pub(crate) revision: u64,
    pub(crate) def: Result<MathObject, Error>,
    pub(crate) deps: Deps,
}

/// The left-hand side of an equation determines what it defines.
#[derive(Debug)]
enum LhsShape {
    /// `name = <number literal>`: a global constant.
    Bare,
    /// `name(p1, ..., pk) = ...`: a function, or a sequence when the
    /// right-hand side carries top-level separators.
    Call { params: Vec<String> },
}

#[derive(Debug)]
struct AnalyzedEquation {
    tokens: Vec<Token>,
    /// Index of the first right-hand-side token.
    rhs_start: usize,
    name: SourceText,
    shape: LhsShape,
}

impl AnalyzedEquation {
    fn rhs(&self) -> &[Token] {
        &self.tokens[self.rhs_start..]
    }
}

/// Splits an equation at its unique top-level `=` and classifies the
/// left-hand side. Anything else is `NotMathObjectDefinition`; a
/// malformed name is `WrongFormat`.
fn analyze_equation(equation: &str) -> Result<AnalyzedEquation, Error> {
    let tokens = tokenize(equation)?;

    let top = top_level_indices(&tokens);
    let mut assignments = top.iter().filter(|&&i| tokens[i].is_assignment());
    let (Some(&eq_index), None) = (assignments.next(), assignments.next()) else {
        return Err(Error::not_math_object_definition());
    };

    let (name, shape) = match &tokens[..eq_index] {
        [token] if token.kind == TokenKind::Variable => (token.text.clone(), LhsShape::Bare),
        [first, second, rest @ ..]
            if first.kind == TokenKind::Function
                && second.kind == TokenKind::FunctionCallStart
                && rest.last().is_some_and(|t| t.kind == TokenKind::FunctionCallEnd) =>
        {
            let inner = &rest[..rest.len() - 1];
            let mut params = Vec::new();
            let mut expect_name = true;
            for token in inner {
                match (expect_name, token.kind) {
                    (true, TokenKind::Variable) => {
                        params.push(token.text.substr.clone());
                        expect_name = false;
                    }
                    (false, TokenKind::Separator) => expect_name = true,
                    _ => return Err(Error::not_math_object_definition()),
                }
            }
            if expect_name {
                return Err(Error::not_math_object_definition());
            }
            (first.text.clone(), LhsShape::Call { params })
        }
        _ => return Err(Error::not_math_object_definition()),
    };

    if !is_valid_name(&name.substr) {
        return Err(Error::wrong_format(name, equation));
    }

    Ok(AnalyzedEquation {
        rhs_start: eq_index + 1,
        tokens,
        name,
        shape,
    })
}

/// The math-world registry: a slotted arena of objects, a name index,
/// and a reverse-dependency graph that keeps every definition consistent
/// as others change.
///
/// Construction seeds the usual constants and native functions. All
/// name-index, reverse-dependency, and revision updates triggered by a
/// mutation complete before the mutating call returns; a dependent
/// rebound during a mutation observes the post-mutation state of its
/// dependencies.
///
/// # Example
///
/// ```
/// # use orrery::MathWorld;
/// let mut world = MathWorld::new();
/// world.define("r = 2").unwrap();
/// world.define("area(x) = math::pi * x^2").unwrap();
///
/// let area = world.get("area").unwrap();
/// assert_eq!(area.evaluate(&[2.0]).unwrap(), std::f64::consts::PI * 4.0);
/// assert_eq!(world.evaluate("area(r)").unwrap(), std::f64::consts::PI * 4.0);
/// ```
#[derive(Debug)]
pub struct MathWorld {
    objects: SlotVec<Entry>,
    inventory: AHashMap<String, SlotId>,
    /// `name -> slots whose definition references that name`, including
    /// references that failed to resolve; this is what revives broken
    /// dependents when the name appears.
    revdeps: AHashMap<String, AHashSet<SlotId>>,
    /// Source of revision stamps. Every mutation draws one fresh value
    /// and stamps its whole reverse-dependency closure with it, so a
    /// dependent's revision is never below that of anything it
    /// references.
    revision_counter: u64,
    config: WorldConfig,
}

impl Default for MathWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl MathWorld {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// A registry storing right-hand sides in the given representation.
    pub fn with_repr(repr: ReprKind) -> Self {
        Self::with_config(WorldConfig {
            repr,
            ..WorldConfig::default()
        })
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let mut world = Self {
            objects: SlotVec::new(),
            inventory: AHashMap::new(),
            revdeps: AHashMap::new(),
            revision_counter: 0,
            config,
        };
        for (name, value) in builtins::CONSTANTS {
            world.install(name, MathObject::Constant(GlobalConstant { value: *value }));
        }
        for (name, f) in builtins::UNARY_FUNCTIONS {
            world.install(
                name,
                MathObject::Builtin(BuiltinFunction {
                    f: builtins::unary(*f),
                }),
            );
        }
        for (name, f) in builtins::BINARY_FUNCTIONS {
            world.install(
                name,
                MathObject::Builtin(BuiltinFunction {
                    f: builtins::binary(*f),
                }),
            );
        }
        world
    }

    /// Installs a seeded object, bypassing equation analysis. Operator
    /// glyphs go through here; they are not lexable names.
    fn install(&mut self, name: &str, object: MathObject) {
        self.revision_counter += 1;
        let slot = self.objects.insert(Entry {
            name: name.to_string(),
            source: None,
            revision: self.revision_counter,
            def: Ok(object),
            deps: Deps::new(),
        });
        self.inventory.insert(name.to_string(), slot);
    }

    pub fn config(&self) -> WorldConfig {
        self.config
    }

    pub(crate) fn max_recursion_depth(&self) -> usize {
        self.config.max_recursion_depth
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inventory.contains_key(name)
    }

    /// Number of live objects, seeded built-ins included.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<(SlotId, &Entry)> {
        let slot = *self.inventory.get(name)?;
        Some((slot, self.objects.get(slot)?))
    }

    pub(crate) fn try_entry(&self, slot: SlotId) -> Option<&Entry> {
        self.objects.get(slot)
    }

    /// The object bound to `name`, live or broken.
    pub fn get(&self, name: &str) -> Option<Obj<'_>> {
        let slot = *self.inventory.get(name)?;
        self.objects.contains(slot).then_some(Obj { world: self, slot })
    }

    /// The object in `slot`, if the slot is live.
    pub fn get_slot(&self, slot: SlotId) -> Option<Obj<'_>> {
        self.objects.contains(slot).then_some(Obj { world: self, slot })
    }

    /// All live objects, in slot order.
    pub fn objects(&self) -> impl Iterator<Item = Obj<'_>> {
        self.objects.iter().map(|(slot, _)| Obj { world: self, slot })
    }

    /// Parses and evaluates a one-off expression against this world
    /// without storing anything.
    pub fn evaluate(&self, expression: &str) -> EvalResult {
        if expression.is_empty() {
            return Err(Error::empty_expression());
        }
        let tokens = tokenize(expression)?;
        let ast = build_ast(&tokens, expression, &[])?;
        let fast = bind(&ast, self, expression)?;
        let parsing = Parsing::from_fast(fast, self.config.repr);
        eval_parsing(self, &parsing, &[], 0)
    }

    /// Creates an object from an equation.
    ///
    /// The left-hand side picks the kind: `name = <literal>` is a
    /// constant, `name(p1, ..., pk) = expr` a function of arity `k`, and
    /// `name(idx) = e0 ; ... ; ek` a sequence whose last segment is the
    /// general term. The name must be new; mutating an existing object
    /// goes through [`redefine`](Self::redefine) or
    /// [`set_constant`](Self::set_constant).
    ///
    /// A right-hand side that fails to parse or resolve still creates
    /// the object; the error is carried in its slot (see [`Obj::error`])
    /// and later registry mutations may revive it. Definitions may
    /// reference themselves; recursion is bounded at evaluation time,
    /// not rejected here.
    pub fn define(&mut self, equation: &str) -> Result<Obj<'_>, Error> {
        let analyzed = analyze_equation(equation)?;
        let name = analyzed.name.substr.clone();
        if self.inventory.contains_key(&name) {
            return Err(Error::name_already_taken(analyzed.name.clone(), equation));
        }

        let slot = self.objects.insert(Entry {
            name: name.clone(),
            source: Some(equation.to_string()),
            revision: 0,
            def: Err(Error::empty_expression()),
            deps: Deps::new(),
        });
        self.inventory.insert(name.clone(), slot);

        debug!("defining '{name}' in {slot}");
        self.process_mutation(&[slot], &[]);
        Ok(Obj { world: self, slot })
    }

    /// Replaces the definition in `slot` with a new equation, preserving
    /// the slot. A left-hand side spelling a different name renames the
    /// object (rejected with `NameAlreadyTaken` if the new name is
    /// bound elsewhere); dependents of both names are revalidated.
    pub fn redefine(&mut self, slot: SlotId, equation: &str) -> Result<Obj<'_>, Error> {
        let Some(entry) = self.objects.get(slot) else {
            return Err(Error::unknown());
        };
        let old_name = entry.name.clone();
        let analyzed = analyze_equation(equation)?;
        let new_name = analyzed.name.substr.clone();

        if new_name != old_name {
            if self.inventory.contains_key(&new_name) {
                return Err(Error::name_already_taken(analyzed.name.clone(), equation));
            }
            self.inventory.remove(&old_name);
            self.inventory.insert(new_name.clone(), slot);
        }
        if let Some(entry) = self.objects.get_mut(slot) {
            entry.name = new_name.clone();
            entry.source = Some(equation.to_string());
        }

        debug!("redefining '{old_name}' -> '{new_name}' in {slot}");
        let old_names = if new_name == old_name { vec![] } else { vec![old_name] };
        self.process_mutation(&[slot], &old_names);
        Ok(Obj { world: self, slot })
    }

    /// Assigns a scalar directly.
    ///
    /// Updates the constant in place when `name` already holds one
    /// (revisions bump, nothing rebinds), replaces the definition when
    /// it holds something else, and creates the constant when the name
    /// is free.
    pub fn set_constant(&mut self, name: &str, value: f64) -> Result<Obj<'_>, Error> {
        if let Some(&slot) = self.inventory.get(name) {
            let Some(entry) = self.objects.get_mut(slot) else {
                return Err(Error::unknown());
            };
            if let Ok(MathObject::Constant(constant)) = &mut entry.def {
                constant.value = value;
                entry.source = None;
                debug!("set constant '{name}' = {value}");
                self.bump_revision_closure(slot);
            } else {
                entry.def = Ok(MathObject::Constant(GlobalConstant { value }));
                entry.source = None;
                debug!("replaced '{name}' with constant {value}");
                self.set_deps(slot, Deps::new());
                self.process_mutation(&[slot], &[]);
            }
            Ok(Obj { world: self, slot })
        } else {
            if !is_valid_name(name) {
                return Err(Error::wrong_format(SourceText::new(name, 0), name));
            }
            self.install(name, MathObject::Constant(GlobalConstant { value }));
            let Some(&slot) = self.inventory.get(name) else {
                return Err(Error::unknown());
            };
            debug!("set constant '{name}' = {value}");
            self.process_mutation(&[slot], &[]);
            Ok(Obj { world: self, slot })
        }
    }

    /// Applies `f` to an existing constant's value (the compound-assign
    /// path). Revisions bump exactly as for
    /// [`set_constant`](Self::set_constant); returns the new value.
    pub fn update_constant(&mut self, name: &str, f: impl FnOnce(f64) -> f64) -> Result<f64, Error> {
        let Some(&slot) = self.inventory.get(name) else {
            return Err(Error::undefined_variable(SourceText::new(name, 0), name));
        };
        let Some(entry) = self.objects.get_mut(slot) else {
            return Err(Error::unknown());
        };
        let Ok(MathObject::Constant(constant)) = &mut entry.def else {
            return Err(Error::wrong_object_type(SourceText::new(name, 0), name));
        };
        constant.value = f(constant.value);
        let value = constant.value;
        self.bump_revision_closure(slot);
        Ok(value)
    }

    /// Replaces a sequence's seed values with literal scalars. An empty
    /// slice leaves pure general-term dispatch.
    pub fn set_sequence_first_values(&mut self, name: &str, values: &[f64]) -> Result<(), Error> {
        let Some(&slot) = self.inventory.get(name) else {
            return Err(Error::undefined_function(SourceText::new(name, 0), name));
        };
        let repr = self.config.repr;
        let Some(entry) = self.objects.get_mut(slot) else {
            return Err(Error::unknown());
        };
        let Ok(MathObject::Sequence(sequence)) = &mut entry.def else {
            return Err(Error::wrong_object_type(SourceText::new(name, 0), name));
        };
        sequence.first_values = values.iter().map(|&v| Parsing::number(v, repr)).collect();
        self.bump_revision_closure(slot);
        Ok(())
    }

    /// Creates a data series keyed by integer row index, one expression
    /// source per row. Empty row sources evaluate to `EmptyExpression`.
    pub fn add_data_series(
        &mut self,
        name: &str,
        index_var: &str,
        rows: Vec<String>,
    ) -> Result<Obj<'_>, Error> {
        if !is_valid_name(name) {
            return Err(Error::wrong_format(SourceText::new(name, 0), name));
        }
        if !is_valid_name(index_var) {
            return Err(Error::wrong_format(SourceText::new(index_var, 0), index_var));
        }
        if self.inventory.contains_key(name) {
            return Err(Error::name_already_taken(SourceText::new(name, 0), name));
        }

        let slot = self.objects.insert(Entry {
            name: name.to_string(),
            source: None,
            revision: 0,
            def: Ok(MathObject::Data(DataSeries {
                index_var: index_var.to_string(),
                rows_src: Vec::new(),
                asts: Vec::new(),
                rows: Vec::new(),
                cache: RefCell::new(ObjectCache::new(self.config.cache_size)),
            })),
            deps: Deps::new(),
        });
        self.inventory.insert(name.to_string(), slot);

        for (row, source) in rows.into_iter().enumerate() {
            self.store_data_row(slot, row, source);
        }
        debug!("added data series '{name}' in {slot}");
        self.process_mutation(&[slot], &[]);
        Ok(Obj { world: self, slot })
    }

    /// Sets the expression of one row of a data series, growing the
    /// series with empty rows if `row` is past the end.
    pub fn set_data_expression(&mut self, name: &str, row: usize, source: &str) -> Result<(), Error> {
        let Some(&slot) = self.inventory.get(name) else {
            return Err(Error::undefined_function(SourceText::new(name, 0), name));
        };
        let is_data = matches!(
            self.objects.get(slot).map(|e| &e.def),
            Some(Ok(MathObject::Data(_)))
        );
        if !is_data {
            return Err(Error::wrong_object_type(SourceText::new(name, 0), name));
        }
        self.store_data_row(slot, row, source.to_string());
        self.rebind_data_rows(slot);
        self.bump_revision_closure(slot);
        Ok(())
    }

    /// Removes the object bound to `name`. Dependents are revalidated
    /// and left in an error state naming the gone object.
    pub fn erase(&mut self, name: &str) -> Result<(), UnregisteredObject> {
        let Some(&slot) = self.inventory.get(name) else {
            return Err(UnregisteredObject);
        };
        self.erase_slot(slot)
    }

    /// Removes the object in `slot`; the slot itself is recycled.
    pub fn erase_slot(&mut self, slot: SlotId) -> Result<(), UnregisteredObject> {
        let Some(entry) = self.objects.remove(slot) else {
            return Err(UnregisteredObject);
        };
        self.inventory.remove(&entry.name);
        for dep_name in entry.deps.keys() {
            if let Some(slots) = self.revdeps.get_mut(dep_name) {
                slots.remove(&slot);
                if slots.is_empty() {
                    self.revdeps.remove(dep_name);
                }
            }
        }
        debug!("erased '{}' from {slot}", entry.name);
        self.process_mutation(&[], std::slice::from_ref(&entry.name));
        Ok(())
    }

    /// Builds the object an analyzed equation defines, resolving names
    /// against this world. Dependencies come from the token stream, so
    /// they are recorded even when tree building or resolution fails.
    fn build_definition(&self, equation: &str, analyzed: &AnalyzedEquation) -> (Result<MathObject, Error>, Deps) {
        let rhs = analyzed.rhs();

        match &analyzed.shape {
            LhsShape::Bare => {
                let deps = direct_dependencies(rhs, &[]);
                (self.build_constant(equation, analyzed), deps)
            }
            LhsShape::Call { params } => {
                let deps = direct_dependencies(rhs, params);
                let segments = split_top_level(rhs, |t| t.kind == TokenKind::Separator);

                if segments.len() == 1 {
                    let def = build_ast_at(rhs, equation, params, analyzed.name.end())
                        .and_then(|ast| bind(&ast, self, equation))
                        .map(|fast| {
                            MathObject::Function(UserFunction {
                                input_vars: params.clone(),
                                rhs: Parsing::from_fast(fast, self.config.repr),
                            })
                        });
                    (def, deps)
                } else {
                    if params.len() != 1 {
                        return (Err(Error::not_math_object_definition()), deps);
                    }
                    let mut parsings = Vec::with_capacity(segments.len());
                    for &(start, end) in &segments {
                        let anchor = if start == 0 {
                            analyzed.tokens[analyzed.rhs_start - 1].text.end()
                        } else {
                            rhs[start - 1].text.end()
                        };
                        let parsed = build_ast_at(&rhs[start..end], equation, params, anchor)
                            .and_then(|ast| bind(&ast, self, equation))
                            .map(|fast| Parsing::from_fast(fast, self.config.repr));
                        match parsed {
                            Ok(parsing) => parsings.push(parsing),
                            Err(e) => return (Err(e), deps),
                        }
                    }
                    let Some(general) = parsings.pop() else {
                        return (Err(Error::unknown()), deps);
                    };
                    let def = Ok(MathObject::Sequence(Sequence {
                        index_var: params[0].clone(),
                        first_values: parsings,
                        general,
                        cache: RefCell::new(ObjectCache::new(self.config.cache_size)),
                    }));
                    (def, deps)
                }
            }
        }
    }

    /// A constant definition's value is the bare number leaf of its
    /// right-hand side; anything else under a bare-name left-hand side
    /// is not an object definition.
    fn build_constant(&self, equation: &str, analyzed: &AnalyzedEquation) -> Result<MathObject, Error> {
        match build_ast_at(analyzed.rhs(), equation, &[], analyzed.name.end()) {
            Ok(Ast {
                node: AstNode::Number(value),
                ..
            }) => Ok(MathObject::Constant(GlobalConstant { value })),
            Ok(_) => Err(Error::not_math_object_definition()),
            Err(e) => Err(e),
        }
    }

    /// The shape-derived stand-in installed before rebinding: carries
    /// the object's kind and arity so that references to it (its own
    /// recursive calls included) resolve while the final definitions of
    /// a mutation's whole dependency closure are still being built.
    fn placeholder_def(&self, equation: &str, analyzed: &AnalyzedEquation) -> Result<MathObject, Error> {
        match &analyzed.shape {
            LhsShape::Bare => self.build_constant(equation, analyzed),
            LhsShape::Call { params } => {
                let segments = split_top_level(analyzed.rhs(), |t| t.kind == TokenKind::Separator);
                if segments.len() == 1 {
                    Ok(MathObject::Function(UserFunction {
                        input_vars: params.clone(),
                        rhs: Parsing::number(f64::NAN, self.config.repr),
                    }))
                } else if params.len() == 1 {
                    Ok(MathObject::Sequence(Sequence {
                        index_var: params[0].clone(),
                        first_values: Vec::new(),
                        general: Parsing::number(f64::NAN, self.config.repr),
                        cache: RefCell::new(ObjectCache::new(self.config.cache_size)),
                    }))
                } else {
                    Err(Error::not_math_object_definition())
                }
            }
        }
    }

    /// Writes a definition and its dependency record into a slot,
    /// keeping the reverse-dependency graph in step.
    fn store_definition(&mut self, slot: SlotId, def: Result<MathObject, Error>, deps: Deps) {
        self.set_deps(slot, deps);
        if let Some(entry) = self.objects.get_mut(slot) {
            entry.def = def;
        }
    }

    fn set_deps(&mut self, slot: SlotId, deps: Deps) {
        let old_names: Vec<String> = match self.objects.get(slot) {
            Some(entry) => entry.deps.keys().cloned().collect(),
            None => return,
        };
        for name in old_names {
            if let Some(slots) = self.revdeps.get_mut(&name) {
                slots.remove(&slot);
                if slots.is_empty() {
                    self.revdeps.remove(&name);
                }
            }
        }
        for name in deps.keys() {
            self.revdeps.entry(name.clone()).or_default().insert(slot);
        }
        if let Some(entry) = self.objects.get_mut(slot) {
            entry.deps = deps;
        }
    }

    /// (Re)binds every row of a data series from its stored syntax
    /// trees, refreshing its dependency record. Row errors stay per-row;
    /// the series object itself remains live.
    fn rebind_data_rows(&mut self, slot: SlotId) {
        let Some(entry) = self.objects.get(slot) else { return };
        let Ok(MathObject::Data(data)) = &entry.def else { return };

        let index_var = data.index_var.clone();
        let asts = data.asts.clone();
        let rows_src = data.rows_src.clone();
        let input_vars = [index_var];

        let mut rows = Vec::with_capacity(asts.len());
        let mut deps = Deps::new();
        for (row, ast) in asts.iter().enumerate() {
            match ast {
                Ok(ast) => {
                    let marked = mark_input_vars(ast.clone(), &input_vars);
                    let bound = bind(&marked, self, &rows_src[row])
                        .map(|fast| Parsing::from_fast(fast, self.config.repr));
                    rows.push(bound);
                }
                Err(e) => rows.push(Err(e.clone())),
            }
            if let Ok(tokens) = tokenize(&rows_src[row]) {
                for (dep_name, info) in direct_dependencies(&tokens, &input_vars) {
                    deps.entry(dep_name)
                        .or_insert_with(|| DepInfo {
                            kind: info.kind,
                            positions: Vec::new(),
                        })
                        .positions
                        .extend(info.positions);
                }
            }
        }

        self.set_deps(slot, deps);
        if let Some(entry) = self.objects.get_mut(slot)
            && let Ok(MathObject::Data(data)) = &mut entry.def
        {
            data.rows = rows;
        }
    }

    /// Stores one row's source and syntax tree, growing the series as
    /// needed. Rebinding is the caller's responsibility.
    fn store_data_row(&mut self, slot: SlotId, row: usize, source: String) {
        let ast = if source.is_empty() {
            Err(Error::empty_expression())
        } else {
            tokenize(&source).and_then(|tokens| build_ast(&tokens, &source, &[]))
        };

        if let Some(entry) = self.objects.get_mut(slot)
            && let Ok(MathObject::Data(data)) = &mut entry.def
        {
            while data.asts.len() <= row {
                data.asts.push(Err(Error::empty_expression()));
                data.rows.push(Err(Error::empty_expression()));
                data.rows_src.push(String::new());
            }
            data.asts[row] = ast;
            data.rows_src[row] = source;
        }
    }

    /// Every live slot that transitively references any of the given
    /// names, breadth-first from the names outward, slot order within a
    /// rank.
    fn collect_dependents(
        &self,
        seen: &mut AHashSet<SlotId>,
        queue: &mut VecDeque<String>,
        affected: &mut Vec<SlotId>,
    ) {
        while let Some(name) = queue.pop_front() {
            let Some(slots) = self.revdeps.get(&name) else { continue };
            let mut sorted: Vec<SlotId> = slots.iter().copied().collect();
            sorted.sort_unstable();
            for slot in sorted {
                if seen.insert(slot)
                    && let Some(entry) = self.objects.get(slot)
                {
                    affected.push(slot);
                    queue.push_back(entry.name.clone());
                }
            }
        }
    }

    /// Stamps `slot` and everything that transitively references it with
    /// a fresh revision, without rebinding (for value-only mutations).
    fn bump_revision_closure(&mut self, slot: SlotId) {
        let Some(entry) = self.objects.get(slot) else { return };
        let name = entry.name.clone();

        let mut seen = AHashSet::new();
        seen.insert(slot);
        let mut queue = VecDeque::new();
        queue.push_back(name);
        let mut affected = vec![slot];
        self.collect_dependents(&mut seen, &mut queue, &mut affected);

        self.revision_counter += 1;
        let stamp = self.revision_counter;
        for slot in affected {
            if let Some(entry) = self.objects.get_mut(slot) {
                entry.revision = stamp;
            }
        }
    }

    /// The consistency sweep behind every definitional mutation.
    ///
    /// Collects the mutated slots plus everything transitively reachable
    /// through reverse dependencies, bumps each revision once, then
    /// rebinds in two phases: first every equation-born slot gets a
    /// shape-derived placeholder (kind and arity only), then each slot
    /// is fully rebound in closure order. The placeholder phase is what
    /// lets cycles — self-recursion and mutual recursion alike — resolve
    /// in a single mutation, with termination left to the evaluation
    /// depth budget.
    fn process_mutation(&mut self, mutated: &[SlotId], gone_names: &[String]) {
        let mut seen: AHashSet<SlotId> = AHashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut affected: Vec<SlotId> = Vec::new();

        for &slot in mutated {
            if seen.insert(slot)
                && let Some(entry) = self.objects.get(slot)
            {
                affected.push(slot);
                queue.push_back(entry.name.clone());
            }
        }
        queue.extend(gone_names.iter().cloned());
        self.collect_dependents(&mut seen, &mut queue, &mut affected);

        if affected.is_empty() {
            return;
        }
        trace!("rebinding {} objects", affected.len());

        self.revision_counter += 1;
        let stamp = self.revision_counter;
        for &slot in &affected {
            if let Some(entry) = self.objects.get_mut(slot) {
                entry.revision = stamp;
            }
        }
        for &slot in &affected {
            self.set_placeholder(slot);
        }
        for &slot in &affected {
            self.rebind_slot(slot);
        }
    }

    /// Phase one of a sweep: equation-born slots get their shape-derived
    /// placeholder (or their analysis error). Seeded objects and data
    /// series keep their live definitions.
    fn set_placeholder(&mut self, slot: SlotId) {
        let Some(entry) = self.objects.get(slot) else { return };
        let Some(source) = entry.source.clone() else { return };
        let def = match analyze_equation(&source) {
            Ok(analyzed) => self.placeholder_def(&source, &analyzed),
            Err(e) => Err(e),
        };
        if let Some(entry) = self.objects.get_mut(slot) {
            entry.def = def;
        }
    }

    /// Phase two of a sweep: the full rebind.
    fn rebind_slot(&mut self, slot: SlotId) {
        let Some(entry) = self.objects.get(slot) else { return };
        if let Some(source) = entry.source.clone() {
            let (def, deps) = match analyze_equation(&source) {
                Ok(analyzed) => self.build_definition(&source, &analyzed),
                Err(e) => (Err(e), Deps::new()),
            };
            self.store_definition(slot, def, deps);
        } else if matches!(entry.def, Ok(MathObject::Data(_))) {
            self.rebind_data_rows(slot);
        }
        // Seeded objects and directly-assigned constants have no source
        // to rebind and no dependencies of their own.
    }
}

/// A borrow-time handle to one registry object.
///
/// Handles are cheap (a registry reference plus a slot) and expose
/// everything read-only callers need: identity, validity, dependencies,
/// and evaluation.
#[derive(Clone, Copy)]
pub struct Obj<'w> {
    world: &'w MathWorld,
    slot: SlotId,
}

impl<'w> Obj<'w> {
    fn entry(&self) -> &'w Entry {
        // A handle borrows the world, so its slot cannot be freed while
        // the handle lives.
        self.world
            .try_entry(self.slot)
            .expect("handle to a live slot")
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn name(&self) -> &'w str {
        &self.entry().name
    }

    /// The defining equation, for objects that came from one.
    pub fn source(&self) -> Option<&'w str> {
        self.entry().source.as_deref()
    }

    /// Monotonic counter: bumps whenever this object's definition or
    /// any definition it transitively references changes.
    pub fn revision(&self) -> u64 {
        self.entry().revision
    }

    /// The object's category, or `None` while it is broken.
    pub fn kind(&self) -> Option<ObjectKind> {
        self.entry().def.as_ref().ok().map(MathObject::kind)
    }

    /// The error currently stored in the slot, if the definition is
    /// broken.
    pub fn error(&self) -> Option<&'w Error> {
        self.entry().def.as_ref().err()
    }

    pub fn is_valid(&self) -> bool {
        self.entry().def.is_ok()
    }

    /// The live object, for kind-specific inspection.
    pub fn object(&self) -> Option<&'w MathObject> {
        self.entry().def.as_ref().ok()
    }

    /// Names this object's definition references directly, each with its
    /// usage kind and occurrence offsets. Input variables are excluded.
    pub fn direct_dependencies(&self) -> &'w Deps {
        &self.entry().deps
    }

    /// A constant's value.
    pub fn value(&self) -> Option<f64> {
        match self.entry().def {
            Ok(MathObject::Constant(c)) => Some(c.value),
            _ => None,
        }
    }

    /// Evaluates the object with the given arguments.
    ///
    /// Constants take none, sequences and data series exactly one,
    /// functions their declared arity; anything else is
    /// `HostArgCountMismatch`. A broken object returns its stored error.
    pub fn evaluate(&self, args: &[f64]) -> EvalResult {
        let entry = self.entry();
        match &entry.def {
            Err(e) => Err(e.clone()),
            Ok(MathObject::Constant(c)) => {
                if args.is_empty() {
                    Ok(c.value)
                } else {
                    Err(Error::host_arg_count_mismatch())
                }
            }
            Ok(MathObject::Builtin(b)) => {
                if args.len() == b.arity() {
                    Ok(b.f.call(args))
                } else {
                    Err(Error::host_arg_count_mismatch())
                }
            }
            Ok(MathObject::Function(f)) => {
                if args.len() == f.input_vars().len() {
                    eval_parsing(self.world, &f.rhs, args, 0)
                } else {
                    Err(Error::host_arg_count_mismatch())
                }
            }
            Ok(MathObject::Sequence(u)) => {
                if args.len() == 1 {
                    u.evaluate(self.world, entry.revision, args[0], 0)
                } else {
                    Err(Error::host_arg_count_mismatch())
                }
            }
            Ok(MathObject::Data(d)) => {
                if args.len() == 1 {
                    d.evaluate(self.world, entry.revision, args[0], 0)
                } else {
                    Err(Error::host_arg_count_mismatch())
                }
            }
        }
    }

    /// Resizes the value cache of a sequence or data series; a no-op for
    /// other kinds.
    pub fn set_cache_size(&self, size: usize) {
        match &self.entry().def {
            Ok(MathObject::Sequence(u)) => u.cache.borrow_mut().set_buffer_size(size),
            Ok(MathObject::Data(d)) => d.cache.borrow_mut().set_buffer_size(size),
            _ => {}
        }
    }
}

impl fmt::Debug for Obj<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Obj")
            .field("slot", &self.slot)
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("revision", &self.revision())
            .finish()
    }
}
