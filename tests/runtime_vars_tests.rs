//! Runtime-variables tests: reified locals with indexed, mutable
//! access, in listed order, across lambda boundaries.

use arbor::{compile, Expr, Type, Value, Var};

#[test]
fn parameters_reified_in_listed_order() {
    // (x: bool, y: int, z: str) reified as (z, x, y)
    let x = Var::new("x", Type::Bool);
    let y = Var::new("y", Type::Int);
    let z = Var::new("z", Type::Str);
    let body = Expr::runtime_variables(vec![z.clone(), x.clone(), y.clone()]);
    let lam = Expr::lambda(
        None,
        vec![x.clone(), y.clone(), z.clone()],
        Type::Variables,
        body,
    );
    let f = compile(&lam).unwrap();
    let out = f
        .invoke(&[
            Value::Bool(true),
            Value::Int(7),
            Value::Str("hi".into()),
        ])
        .unwrap();
    let vars = out.as_record().expect("a variables handle");
    assert_eq!(vars.len(), 3);
    assert_eq!(vars.get(0).unwrap().as_str(), Some("hi"));
    assert_eq!(vars.get(1).unwrap().to_bool(), Some(true));
    assert_eq!(vars.get(2).unwrap().to_int(), Some(7));
}

#[test]
fn writes_route_to_the_right_variable() {
    // Write through each index, then observe the variables directly.
    let x = Var::new("x", Type::Bool);
    let y = Var::new("y", Type::Int);
    let z = Var::new("z", Type::Str);
    let handle = Var::new("handle", Type::Variables);
    let body = Expr::block(
        vec![handle.clone()],
        vec![
            Expr::assign(
                Expr::variable(&handle),
                Expr::runtime_variables(vec![z.clone(), x.clone(), y.clone()]),
            ),
            Expr::variable(&handle),
        ],
    );
    let lam = Expr::lambda(
        None,
        vec![x.clone(), y.clone(), z.clone()],
        Type::Variables,
        body,
    );
    let f = compile(&lam).unwrap();
    let out = f
        .invoke(&[Value::Bool(false), Value::Int(0), Value::Str("".into())])
        .unwrap();
    let vars = out.as_record().unwrap();

    vars.set(0, Value::Str("changed".into())).unwrap();
    vars.set(1, Value::Bool(true)).unwrap();
    vars.set(2, Value::Int(42)).unwrap();

    assert_eq!(vars.get(0).unwrap().as_str(), Some("changed"));
    assert_eq!(vars.get(1).unwrap().to_bool(), Some(true));
    assert_eq!(vars.get(2).unwrap().to_int(), Some(42));
}

#[test]
fn writes_are_visible_to_compiled_code() {
    // The handle escapes, the caller writes through it, and a second
    // compiled reader lambda sees the new value.
    let n = Var::new("n", Type::Int);
    let reader = Expr::lambda(None, vec![], Type::Int, Expr::variable(&n));
    let pair = Expr::new_array(
        Type::Object,
        vec![Expr::runtime_variables(vec![n.clone()]), reader],
    );
    let body = Expr::block(
        vec![n.clone()],
        vec![Expr::assign(Expr::variable(&n), Expr::int(1)), pair],
    );
    let lam = Expr::lambda(None, vec![], body.ty().clone(), body);
    let f = compile(&lam).unwrap();
    let out = f.invoke(&[]).unwrap();
    let arr = out.as_array().unwrap();
    let (handle, reader) = {
        let items = arr.read().unwrap();
        (
            items[0].as_record().unwrap().clone(),
            items[1].as_function().unwrap().clone(),
        )
    };
    assert_eq!(reader.invoke(&[]).unwrap().to_int(), Some(1));
    handle.set(0, Value::Int(55)).unwrap();
    assert_eq!(reader.invoke(&[]).unwrap().to_int(), Some(55));
}

#[test]
fn reify_variables_of_an_enclosing_lambda() {
    // The inner lambda reifies the outer's parameter.
    let x = Var::new("x", Type::Int);
    let inner = Expr::lambda(
        None,
        vec![],
        Type::Variables,
        Expr::runtime_variables(vec![x.clone()]),
    );
    let outer = Expr::lambda(None, vec![x.clone()], inner.ty().clone(), inner);
    let f = compile(&outer).unwrap();
    let g = f.invoke(&[Value::Int(5)]).unwrap();
    let g = g.as_function().unwrap();
    let handle = g.invoke(&[]).unwrap();
    let handle = handle.as_record().unwrap().clone();
    assert_eq!(handle.get(0).unwrap().to_int(), Some(5));
    handle.set(0, Value::Int(6)).unwrap();
    let again = g.invoke(&[]).unwrap();
    let again = again.as_record().unwrap().clone();
    assert_eq!(again.get(0).unwrap().to_int(), Some(6));
}

#[test]
fn merged_handles_concatenate() {
    use arbor::runtime::ops::merge_runtime_variables;

    let a = Var::new("a", Type::Int);
    let b = Var::new("b", Type::Int);
    let pair = Expr::new_array(
        Type::Variables,
        vec![
            Expr::runtime_variables(vec![a.clone()]),
            Expr::runtime_variables(vec![b.clone()]),
        ],
    );
    let body = Expr::block(
        vec![a.clone(), b.clone()],
        vec![
            Expr::assign(Expr::variable(&a), Expr::int(1)),
            Expr::assign(Expr::variable(&b), Expr::int(2)),
            pair,
        ],
    );
    let lam = Expr::lambda(None, vec![], body.ty().clone(), body);
    let out = compile(&lam).unwrap().invoke(&[]).unwrap();
    let arr = out.as_array().unwrap();
    let (first, second) = {
        let items = arr.read().unwrap();
        (items[0].clone(), items[1].clone())
    };
    let merged = merge_runtime_variables(&[first, second]).unwrap();
    let merged = merged.as_record().unwrap().clone();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged.get(0).unwrap().to_int(), Some(1));
    assert_eq!(merged.get(1).unwrap().to_int(), Some(2));
}

#[test]
fn quoted_and_reified_variable_shares_one_storage() {
    // A variable that is both quoted and runtime-referenced is a boxed
    // cell in the record; both views must alias it.
    let n = Var::new("n", Type::Int);
    let pair = Expr::new_array(
        Type::Object,
        vec![
            Expr::runtime_variables(vec![n.clone()]),
            Expr::quote(Expr::variable(&n)),
        ],
    );
    let body = Expr::block(
        vec![n.clone()],
        vec![Expr::assign(Expr::variable(&n), Expr::int(10)), pair],
    );
    let lam = Expr::lambda(None, vec![], body.ty().clone(), body);
    let out = compile(&lam).unwrap().invoke(&[]).unwrap();
    let arr = out.as_array().unwrap();
    let (handle, quoted) = {
        let items = arr.read().unwrap();
        (items[0].as_record().unwrap().clone(), items[1].clone())
    };
    handle.set(0, Value::Int(77)).unwrap();
    let cell = match quoted.as_tree().unwrap().kind() {
        arbor::ExprKind::CellRef { cell } => cell.clone(),
        other => panic!("expected a cell reference, got {other:?}"),
    };
    assert_eq!(cell.get().to_int(), Some(77));
}
