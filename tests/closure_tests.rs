//! Closure tests: capture, hoisting, nested chains, inlined invokes,
//! and the large-record boundary.

use arbor::{compile, BinaryOp, Expr, Type, Value, Var};

#[test]
fn nested_closure_adds_captured_parameter() {
    // (lambda (x) (lambda (y) (+ x y)))
    let x = Var::new("x", Type::Int);
    let y = Var::new("y", Type::Int);
    let inner = Expr::lambda(
        None,
        vec![y.clone()],
        Type::Int,
        Expr::add(Expr::variable(&x), Expr::variable(&y)),
    );
    let outer = Expr::lambda(None, vec![x.clone()], inner.ty().clone(), inner);

    let f = compile(&outer).unwrap();
    let adder = f.invoke(&[Value::Int(1)]).unwrap();
    let adder = adder.as_function().expect("a function value");
    assert_eq!(adder.invoke(&[Value::Int(2)]).unwrap().to_int(), Some(3));
    assert_eq!(adder.invoke(&[Value::Int(3)]).unwrap().to_int(), Some(4));
}

#[test]
fn two_closures_share_one_variable() {
    // A counter: returns a lambda that increments the shared count.
    let count = Var::new("count", Type::Int);
    let bump = Expr::lambda(
        None,
        vec![],
        Type::Int,
        Expr::assign(
            Expr::variable(&count),
            Expr::add(Expr::variable(&count), Expr::int(1)),
        ),
    );
    let body = Expr::block(
        vec![count.clone()],
        vec![
            Expr::assign(Expr::variable(&count), Expr::int(0)),
            bump,
        ],
    );
    let lam = Expr::lambda(None, vec![], body.ty().clone(), body);
    let f = compile(&lam).unwrap();
    let counter = f.invoke(&[]).unwrap();
    let counter = counter.as_function().expect("a function value");
    assert_eq!(counter.invoke(&[]).unwrap().to_int(), Some(1));
    assert_eq!(counter.invoke(&[]).unwrap().to_int(), Some(2));
    assert_eq!(counter.invoke(&[]).unwrap().to_int(), Some(3));
}

#[test]
fn separate_outer_calls_get_separate_records() {
    let count = Var::new("c", Type::Int);
    let bump = Expr::lambda(
        None,
        vec![],
        Type::Int,
        Expr::assign(
            Expr::variable(&count),
            Expr::add(Expr::variable(&count), Expr::int(1)),
        ),
    );
    let body = Expr::block(
        vec![count.clone()],
        vec![Expr::assign(Expr::variable(&count), Expr::int(0)), bump],
    );
    let lam = Expr::lambda(None, vec![], body.ty().clone(), body);
    let f = compile(&lam).unwrap();
    let a = f.invoke(&[]).unwrap();
    let b = f.invoke(&[]).unwrap();
    let a = a.as_function().unwrap();
    let b = b.as_function().unwrap();
    assert_eq!(a.invoke(&[]).unwrap().to_int(), Some(1));
    assert_eq!(b.invoke(&[]).unwrap().to_int(), Some(1));
    assert_eq!(a.invoke(&[]).unwrap().to_int(), Some(2));
}

#[test]
fn three_level_chain_reaches_grandparent() {
    // λx. λy. λz. x + y + z
    let x = Var::new("x", Type::Int);
    let y = Var::new("y", Type::Int);
    let z = Var::new("z", Type::Int);
    let innermost = Expr::lambda(
        None,
        vec![z.clone()],
        Type::Int,
        Expr::add(
            Expr::add(Expr::variable(&x), Expr::variable(&y)),
            Expr::variable(&z),
        ),
    );
    let middle = Expr::lambda(None, vec![y.clone()], innermost.ty().clone(), innermost);
    let outer = Expr::lambda(None, vec![x.clone()], middle.ty().clone(), middle);

    let f = compile(&outer).unwrap();
    let g = f.invoke(&[Value::Int(100)]).unwrap();
    let g = g.as_function().unwrap();
    let h = g.invoke(&[Value::Int(20)]).unwrap();
    let h = h.as_function().unwrap();
    assert_eq!(h.invoke(&[Value::Int(3)]).unwrap().to_int(), Some(123));
}

#[test]
fn eighteen_hoisted_variables_round_trip_twice() {
    // Bind 18 distinct-typed locals, return a lambda yielding an array
    // of all of them. Two invocations must both see the originals.
    let vars: Vec<_> = (0..18)
        .map(|i| {
            let ty = match i % 3 {
                0 => Type::Int,
                1 => Type::Str,
                _ => Type::Bool,
            };
            Var::new(format!("v{i}"), ty)
        })
        .collect();
    let values: Vec<Value> = (0..18)
        .map(|i| match i % 3 {
            0 => Value::Int(i as i64),
            1 => Value::Str(format!("s{i}").into()),
            _ => Value::Bool(i % 2 == 0),
        })
        .collect();

    let mut stmts: Vec<_> = vars
        .iter()
        .zip(&values)
        .map(|(v, val)| {
            Expr::assign(
                Expr::variable(v),
                Expr::constant(val.clone(), v.ty().clone()),
            )
        })
        .collect();
    let array = Expr::new_array(
        Type::Object,
        vars.iter().map(Expr::variable).collect(),
    );
    stmts.push(Expr::lambda(None, vec![], array.ty().clone(), array));
    let body = Expr::block(vars.clone(), stmts);
    let lam = Expr::lambda(None, vec![], body.ty().clone(), body);

    let f = compile(&lam).unwrap();
    let getter = f.invoke(&[]).unwrap();
    let getter = getter.as_function().unwrap();
    for _ in 0..2 {
        let out = getter.invoke(&[]).unwrap();
        let arr = out.as_array().expect("an array");
        let items = arr.read().unwrap();
        assert_eq!(items.len(), 18);
        for (item, expected) in items.iter().zip(&values) {
            assert_eq!(item, expected);
        }
    }
}

#[test]
fn inlined_invoke_binds_parameters_in_place() {
    // (invoke (lambda (a b) (- a b)) 10 4) with a literal lambda target
    let a = Var::new("a", Type::Int);
    let b = Var::new("b", Type::Int);
    let target = Expr::lambda(
        None,
        vec![a.clone(), b.clone()],
        Type::Int,
        Expr::binary(BinaryOp::Sub, Expr::variable(&a), Expr::variable(&b)),
    );
    let body = Expr::invoke(target, vec![Expr::int(10), Expr::int(4)]);
    let lam = Expr::lambda(None, vec![], Type::Int, body);
    let f = compile(&lam).unwrap();
    // no delegate is constructed for the inlined target
    assert!(!f.disassemble().contains("mkdelegate"));
    assert_eq!(f.invoke(&[]).unwrap().to_int(), Some(6));
}

#[test]
fn invoke_of_delegate_value() {
    // The target is a parameter, so the call goes through the delegate.
    let add1 = {
        let n = Var::new("n", Type::Int);
        let lam = Expr::lambda(
            None,
            vec![n.clone()],
            Type::Int,
            Expr::add(Expr::variable(&n), Expr::int(1)),
        );
        compile(&lam).unwrap()
    };
    let f_ty = add1_type();
    let g = Var::new("g", f_ty.clone());
    let body = Expr::invoke(Expr::variable(&g), vec![Expr::int(41)]);
    let lam = Expr::lambda(None, vec![g], Type::Int, body);
    let f = compile(&lam).unwrap();
    assert_eq!(
        f.invoke(&[Value::Function(add1)]).unwrap().to_int(),
        Some(42)
    );
}

fn add1_type() -> Type {
    let n = Var::new("n", Type::Int);
    Expr::lambda(
        None,
        vec![n.clone()],
        Type::Int,
        Expr::add(Expr::variable(&n), Expr::int(1)),
    )
    .ty()
    .clone()
}

#[test]
fn uncaptured_local_stays_off_the_record() {
    // One captured variable, one plain local: the record must not carry
    // the local.
    let kept = Var::new("kept", Type::Int);
    let plain = Var::new("plain", Type::Int);
    let inner = Expr::lambda(None, vec![], Type::Int, Expr::variable(&kept));
    let body = Expr::block(
        vec![kept.clone(), plain.clone()],
        vec![
            Expr::assign(Expr::variable(&kept), Expr::int(1)),
            Expr::assign(Expr::variable(&plain), Expr::int(2)),
            Expr::variable(&plain),
            inner,
        ],
    );
    let lam = Expr::lambda(None, vec![], body.ty().clone(), body);
    let f = compile(&lam).unwrap();
    let listing = f.disassemble();
    assert!(listing.contains("newrecord 1"));
    let getter = f.invoke(&[]).unwrap();
    let getter = getter.as_function().unwrap();
    assert_eq!(getter.invoke(&[]).unwrap().to_int(), Some(1));
}

#[test]
fn mutation_through_closure_is_visible_outside() {
    // λ(). block { n; s = λv. n = v; s(7) via delegate; n }
    let n = Var::new("n", Type::Int);
    let v = Var::new("v", Type::Int);
    let setter = Expr::lambda(
        None,
        vec![v.clone()],
        Type::Int,
        Expr::assign(Expr::variable(&n), Expr::variable(&v)),
    );
    let s = Var::new("s", setter.ty().clone());
    let body = Expr::block(
        vec![n.clone(), s.clone()],
        vec![
            Expr::assign(Expr::variable(&n), Expr::int(0)),
            Expr::assign(Expr::variable(&s), setter),
            Expr::invoke(Expr::variable(&s), vec![Expr::int(7)]),
            Expr::variable(&n),
        ],
    );
    let lam = Expr::lambda(None, vec![], Type::Int, body);
    let f = compile(&lam).unwrap();
    assert_eq!(f.invoke(&[]).unwrap().to_int(), Some(7));
}
