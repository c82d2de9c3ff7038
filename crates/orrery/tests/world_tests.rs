//! Registry scenarios: definitions, seeded objects, dependency-driven
//! revalidation, revisions, and the recursion budget. Evaluation-heavy
//! cases run in both storage representations.

use orrery::{ErrorKind, MathWorld, ObjectKind, ReprKind, UnregisteredObject};
use pretty_assertions::assert_eq;

fn both_worlds() -> [MathWorld; 2] {
    [MathWorld::new(), MathWorld::with_repr(ReprKind::Postfix)]
}

// =============================================================================
// 1. Anonymous evaluation and seeded objects
// =============================================================================

/// A freshly constructed registry evaluates plain arithmetic.
#[test]
fn simple_arithmetic() {
    for world in both_worlds() {
        assert_eq!(world.evaluate("2+2*2").unwrap(), 6.0);
        assert_eq!(world.evaluate("(2+2)*2").unwrap(), 8.0);
        assert_eq!(world.evaluate("6/3/2").unwrap(), 1.0);
    }
}

/// The usual constants and native functions are installed at
/// construction.
#[test]
fn seeded_taxonomy() {
    let world = MathWorld::new();
    assert_eq!(world.get("sqrt").unwrap().evaluate(&[4.0]).unwrap(), 2.0);
    assert_eq!(
        world.get("math::pi").unwrap().value().unwrap(),
        std::f64::consts::PI
    );
    assert_eq!(world.get("math::π").unwrap().value(), world.get("math::pi").unwrap().value());
    assert_eq!(world.get("physics::c").unwrap().value().unwrap(), 299_792_458.0);
    assert!(world.contains("erf"));
    assert!(world.contains("Γ"));
    assert_eq!(world.evaluate("cos(0) + sin(0)").unwrap(), 1.0);
}

/// Binary operators are regular registry objects named by their glyph.
#[test]
fn operator_objects() {
    let world = MathWorld::new();
    let plus = world.get("+").unwrap();
    assert_eq!(plus.kind(), Some(ObjectKind::Builtin));
    assert_eq!(plus.evaluate(&[2.0, 3.0]).unwrap(), 5.0);
    assert_eq!(world.get("^").unwrap().evaluate(&[2.0, 10.0]).unwrap(), 1024.0);
}

// =============================================================================
// 2. Definitions
// =============================================================================

/// `name = <literal>` defines a constant; the scalar comes straight from
/// the literal.
#[test]
fn define_constant() {
    let mut world = MathWorld::new();
    let constant = world.define("my_constant1 = 42").unwrap();
    assert_eq!(constant.kind(), Some(ObjectKind::Constant));
    assert_eq!(constant.value(), Some(42.0));
    assert_eq!(constant.name(), "my_constant1");
}

/// Whitespace around the equation does not leak into names.
#[test]
fn define_constant_with_whitespace() {
    let mut world = MathWorld::new();
    let constant = world.define("   my_constant1 = 2.0").unwrap();
    assert_eq!(constant.name(), "my_constant1");
}

/// Defining a bound name again is rejected; mutation goes through
/// `redefine`.
#[test]
fn define_taken_name() {
    let mut world = MathWorld::new();
    world.define("my_constant1 = 2.0").unwrap();
    let err = world.define("my_constant1 = 3.0").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NameAlreadyTaken);

    let err = world.define("cos(x) = 1").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NameAlreadyTaken);
}

/// Equations without a usable definition shape are rejected outright,
/// with no slot created.
#[test]
fn define_rejects_non_definitions() {
    let mut world = MathWorld::new();
    assert_eq!(
        world.define("2 = 2").unwrap_err().kind,
        ErrorKind::NotMathObjectDefinition
    );
    assert_eq!(
        world.define("f(x)").unwrap_err().kind,
        ErrorKind::NotMathObjectDefinition
    );
    assert_eq!(
        world.define("a = 2 = 3").unwrap_err().kind,
        ErrorKind::NotMathObjectDefinition
    );
    assert_eq!(
        world.define("f(2) = 1").unwrap_err().kind,
        ErrorKind::NotMathObjectDefinition
    );
}

/// A bare-name left-hand side only accepts a literal right-hand side;
/// the object is created but carries the error.
#[test]
fn constant_rhs_must_be_literal() {
    let mut world = MathWorld::new();
    let obj = world.define("a = 2*3").unwrap();
    assert_eq!(obj.error().unwrap().kind, ErrorKind::NotMathObjectDefinition);
    assert!(!obj.is_valid());
    // A parenthesized (or signed) literal is still a literal.
    assert_eq!(world.define("b = (2)").unwrap().value(), Some(2.0));
    assert_eq!(world.define("neg = -1.5").unwrap().value(), Some(-1.5));
}

// =============================================================================
// 3. Composition and propagation
// =============================================================================

/// Reassigning a constant reaches every function that mentions it, with
/// no explicit reparse.
#[test]
fn constant_function_composition() {
    for mut world in both_worlds() {
        world.define("c = 3").unwrap();
        world.define("f(x) = x + c").unwrap();
        assert_eq!(world.get("f").unwrap().evaluate(&[4.0]).unwrap(), 7.0);

        world.set_constant("c", 10.0).unwrap();
        assert_eq!(world.get("f").unwrap().evaluate(&[4.0]).unwrap(), 14.0);
    }
}

/// The multi-argument call pipeline: nested user functions with shared
/// subcalls.
#[test]
fn multi_argument_composition() {
    for mut world in both_worlds() {
        world.define("h(c,d)= c*d + c-d").unwrap();
        world.define("g(a,b)= h(a, a*b) + 3*a - b").unwrap();
        world.define("f(x,y)= h(x, g(x,y)) + g(y, h(y,x))").unwrap();
        assert_eq!(world.get("f").unwrap().evaluate(&[5.0, 3.0]).unwrap(), 390.0);
    }
}

/// Defining a function whose callee does not exist yet leaves it broken;
/// defining the callee revives it without any explicit call.
#[test]
fn dangling_reference_revival() {
    for mut world in both_worlds() {
        let f = world.define("f(x) = g(x)+1").unwrap();
        let err = f.error().unwrap();
        assert_eq!(err.kind, ErrorKind::UndefinedFunction);
        assert_eq!(err.token.substr, "g");
        assert_eq!(err.token.begin, 7);
        assert_eq!(f.evaluate(&[3.0]).unwrap_err().kind, ErrorKind::UndefinedFunction);

        world.define("g(x) = 2*x").unwrap();
        let f = world.get("f").unwrap();
        assert!(f.is_valid());
        assert_eq!(f.evaluate(&[3.0]).unwrap(), 7.0);
    }
}

/// A chain of broken references: the directly broken object reports the
/// missing name, its dependents report the broken object, and closing
/// the cycle revives all of them at once.
#[test]
fn invalidity_chain_and_cycle() {
    let mut world = MathWorld::new();

    let f = world.define("f(x) = g(x)+1").unwrap();
    let err = f.error().unwrap();
    assert_eq!((err.kind, err.token.substr.as_str(), err.token.begin), (ErrorKind::UndefinedFunction, "g", 7));

    world.define("g(x) = z(x)+1").unwrap();
    let f = world.get("f").unwrap();
    let g = world.get("g").unwrap();
    let f_err = f.error().unwrap();
    assert_eq!((f_err.kind, f_err.token.substr.as_str()), (ErrorKind::ObjectInvalidState, "g"));
    let g_err = g.error().unwrap();
    assert_eq!((g_err.kind, g_err.token.substr.as_str()), (ErrorKind::UndefinedFunction, "z"));

    // Closing the loop makes every link valid in one mutation; the
    // cycle is caught at evaluation time by the depth budget.
    world.define("z(x) = f(x)+1").unwrap();
    assert!(world.get("f").unwrap().is_valid());
    assert!(world.get("g").unwrap().is_valid());
    let z = world.get("z").unwrap();
    assert!(z.is_valid());
    assert_eq!(
        z.evaluate(&[1.0]).unwrap_err().kind,
        ErrorKind::RecursionDepthOverflow
    );
}

/// Erasing an object breaks its dependents and frees its name and slot.
#[test]
fn erase_invalidates_dependents() {
    let mut world = MathWorld::new();
    world.define("f(x) = cos(x)").unwrap();
    world.define("g(x) = f(x)+1").unwrap();
    assert!(world.get("g").unwrap().is_valid());

    world.erase("f").unwrap();
    assert_eq!(world.erase("f"), Err(UnregisteredObject));
    assert!(world.get("f").is_none());

    let g = world.get("g").unwrap();
    let err = g.error().unwrap();
    assert_eq!(err.kind, ErrorKind::UndefinedFunction);
    assert_eq!(err.token.substr, "f");
}

/// Built-ins are ordinary objects: erasing one invalidates everything
/// that referenced it.
#[test]
fn erase_builtin() {
    let mut world = MathWorld::new();
    world.define("f(x) = cos(x)").unwrap();
    world.erase("cos").unwrap();
    assert_eq!(world.erase("cos"), Err(UnregisteredObject));

    let f = world.get("f").unwrap();
    let err = f.error().unwrap();
    assert_eq!(err.kind, ErrorKind::UndefinedFunction);
    assert_eq!(err.token.substr, "cos");
}

/// `redefine` replaces a slot's contents in place and may rename it;
/// dependents of both names follow.
#[test]
fn redefine_and_rename() {
    let mut world = MathWorld::new();
    let c = world.define("c = 3").unwrap();
    let slot = c.slot();
    world.define("f(x) = x + c").unwrap();

    world.redefine(slot, "c = 5").unwrap();
    assert_eq!(world.get("f").unwrap().evaluate(&[1.0]).unwrap(), 6.0);

    let renamed = world.redefine(slot, "d = 7").unwrap();
    assert_eq!(renamed.name(), "d");
    assert_eq!(renamed.slot(), slot, "slot survives the rename");
    assert!(world.get("c").is_none());
    assert_eq!(world.get("d").unwrap().value(), Some(7.0));

    // 'f' still says "c", which no longer exists.
    let f = world.get("f").unwrap();
    assert_eq!(f.error().unwrap().kind, ErrorKind::UndefinedVariable);

    // Renaming onto a bound name is refused.
    world.define("e = 1").unwrap();
    let err = world.redefine(slot, "e = 2").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NameAlreadyTaken);
}

// =============================================================================
// 4. Revisions
// =============================================================================

/// Any definitional mutation strictly increases the revision of every
/// object that transitively references the mutated one.
#[test]
fn revision_monotonicity() {
    let mut world = MathWorld::new();
    world.define("c = 3").unwrap();
    world.define("f(x) = x + c").unwrap();
    world.define("g(x) = f(x) * 2").unwrap();

    let before = ["c", "f", "g"].map(|n| world.get(n).unwrap().revision());
    world.set_constant("c", 4.0).unwrap();
    let after = ["c", "f", "g"].map(|n| world.get(n).unwrap().revision());

    for (b, a) in before.iter().zip(&after) {
        assert!(a > b, "expected strict increase, got {b} -> {a}");
    }

    // An unrelated object is untouched.
    world.define("lonely = 9").unwrap();
    let lonely_before = world.get("lonely").unwrap().revision();
    world.set_constant("c", 5.0).unwrap();
    assert_eq!(world.get("lonely").unwrap().revision(), lonely_before);
}

/// The compound-assign path updates in place and reports the new value.
#[test]
fn update_constant() {
    let mut world = MathWorld::new();
    world.define("c = 3").unwrap();
    world.define("f(x) = x + c").unwrap();

    let rev = world.get("c").unwrap().revision();
    assert_eq!(world.update_constant("c", |v| v + 2.0).unwrap(), 5.0);
    assert!(world.get("c").unwrap().revision() > rev);
    assert_eq!(world.get("f").unwrap().evaluate(&[0.0]).unwrap(), 5.0);

    assert_eq!(
        world.update_constant("cos", |v| v).unwrap_err().kind,
        ErrorKind::WrongObjectType
    );
    assert_eq!(
        world.update_constant("ghost", |v| v).unwrap_err().kind,
        ErrorKind::UndefinedVariable
    );
}

// =============================================================================
// 5. Handles
// =============================================================================

/// The dependency report names each referenced object with its usage
/// kind and occurrence offsets, input variables excluded.
#[test]
fn dependency_report() {
    let mut world = MathWorld::new();
    let f = world.define("f(x) = cos(x) + c * x").unwrap();
    let deps = f.direct_dependencies();

    assert_eq!(deps.len(), 2);
    assert_eq!(deps["cos"].kind, orrery::DepKind::Function);
    assert_eq!(deps["cos"].positions, vec![7]);
    assert_eq!(deps["c"].kind, orrery::DepKind::Variable);
    assert_eq!(deps["c"].positions, vec![16]);
    assert!(!deps.contains_key("x"));
}

/// Programmatic evaluation checks arity before touching the definition.
#[test]
fn host_arity_is_checked() {
    let mut world = MathWorld::new();
    world.define("c = 1").unwrap();
    world.define("f(x,y) = x + y").unwrap();

    assert_eq!(
        world.get("f").unwrap().evaluate(&[1.0]).unwrap_err().kind,
        ErrorKind::HostArgCountMismatch
    );
    assert_eq!(
        world.get("c").unwrap().evaluate(&[1.0]).unwrap_err().kind,
        ErrorKind::HostArgCountMismatch
    );
    assert_eq!(
        world.get("cos").unwrap().evaluate(&[]).unwrap_err().kind,
        ErrorKind::HostArgCountMismatch
    );
    assert_eq!(world.get("c").unwrap().evaluate(&[]).unwrap(), 1.0);
}

/// The recursion budget turns non-terminating definitions into a typed
/// error instead of a stack overflow.
#[test]
fn recursion_bound() {
    for mut world in both_worlds() {
        let f = world.define("f(x) = f(x)+1").unwrap();
        assert!(f.is_valid(), "self-recursion parses fine");
        assert_eq!(
            f.evaluate(&[0.0]).unwrap_err().kind,
            ErrorKind::RecursionDepthOverflow
        );

        world.define("bad(n) = bad(n+10) + bad(n+20)").unwrap();
        assert_eq!(
            world.get("bad").unwrap().evaluate(&[0.0]).unwrap_err().kind,
            ErrorKind::RecursionDepthOverflow
        );
    }
}

/// Objects enumerate with stable identity; erased slots are recycled.
#[test]
fn slots_are_recycled() {
    let mut world = MathWorld::new();
    let count = world.object_count();
    let a = world.define("a = 1").unwrap().slot();
    world.erase("a").unwrap();
    let b = world.define("b = 2").unwrap().slot();
    assert_eq!(a, b, "freed slot is handed back out");
    assert_eq!(world.object_count(), count + 1);
    assert!(world.objects().any(|o| o.name() == "b"));
}
