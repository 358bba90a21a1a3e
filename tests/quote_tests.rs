//! Quote tests: reification, cell aliasing between quotes and the
//! enclosing lambda, and re-compilation of reified trees.

use std::sync::Arc;

use arbor::runtime::ValueCell;
use arbor::{compile, Expr, ExprKind, Method, Type, Value, Var};

/// Pull the shared cell out of a reified variable reference.
fn cell_of(tree: &Value) -> Arc<ValueCell> {
    let tree = tree.as_tree().expect("a tree value");
    match tree.kind() {
        ExprKind::CellRef { cell } => cell.clone(),
        other => panic!("expected a cell reference, got {other:?}"),
    }
}

#[test]
fn closed_quote_evaluates_to_its_tree() {
    let body = Expr::quote(Expr::add(Expr::int(1), Expr::int(2)));
    let lam = Expr::lambda(None, vec![], Type::Tree, body);
    let f = compile(&lam).unwrap();
    let out = f.invoke(&[]).unwrap();
    let tree = out.as_tree().expect("a tree value");
    assert!(matches!(tree.kind(), ExprKind::Binary { .. }));
}

#[test]
fn two_quotes_of_one_variable_share_a_cell() {
    // λx. f(quote x, quote x): f mutates through the first quote; the
    // change must be visible through the second and through x itself.
    let witness = Arc::new(std::sync::Mutex::new(Vec::new()));
    let witness_in = witness.clone();
    let f = Method::new("poke", Some(2), move |args| {
        let first = cell_of(&args[0]);
        let second = cell_of(&args[1]);
        witness_in.lock().unwrap().push(second.get());
        first.set(Value::Int(99));
        witness_in.lock().unwrap().push(second.get());
        Ok(Value::Nil)
    });

    let x = Var::new("x", Type::Int);
    let body = Expr::block(
        vec![],
        vec![
            Expr::call(
                f,
                Type::Void,
                vec![
                    Expr::quote(Expr::variable(&x)),
                    Expr::quote(Expr::variable(&x)),
                ],
            ),
            Expr::variable(&x),
        ],
    );
    let lam = Expr::lambda(None, vec![x.clone()], Type::Int, body);
    let compiled = compile(&lam).unwrap();

    // the mutation is visible via the returned value of x after the call
    assert_eq!(compiled.invoke(&[Value::Int(1)]).unwrap().to_int(), Some(99));
    let seen = witness.lock().unwrap();
    assert_eq!(seen[0].to_int(), Some(1));
    assert_eq!(seen[1].to_int(), Some(99));
}

#[test]
fn quote_survives_the_enclosing_lambda() {
    // λx. quote (x + 1): compile the reified tree afterwards; it reads
    // the cell captured at the original call.
    let x = Var::new("x", Type::Int);
    let body = Expr::quote(Expr::add(Expr::variable(&x), Expr::int(1)));
    let lam = Expr::lambda(None, vec![x.clone()], Type::Tree, body);
    let f = compile(&lam).unwrap();

    let reified = f.invoke(&[Value::Int(41)]).unwrap();
    let tree = reified.as_tree().unwrap().clone();
    let rewrapped = Expr::lambda(None, vec![], Type::Int, tree);
    let g = compile(&rewrapped).unwrap();
    assert_eq!(g.invoke(&[]).unwrap().to_int(), Some(42));
}

#[test]
fn assignment_inside_reified_tree_updates_the_cell() {
    // λx. quote (x = 7): compiling and running the quote writes the
    // cell, observable through a second quote of x from the same call.
    let x = Var::new("x", Type::Int);
    let body = Expr::new_array(
        Type::Tree,
        vec![
            Expr::quote(Expr::assign(Expr::variable(&x), Expr::int(7))),
            Expr::quote(Expr::variable(&x)),
        ],
    );
    let lam = Expr::lambda(None, vec![x.clone()], body.ty().clone(), body);
    let f = compile(&lam).unwrap();
    let out = f.invoke(&[Value::Int(0)]).unwrap();
    let arr = out.as_array().unwrap();
    let (setter_tree, reader_cell) = {
        let items = arr.read().unwrap();
        (items[0].as_tree().unwrap().clone(), cell_of(&items[1]))
    };

    let setter = compile(&Expr::lambda(None, vec![], Type::Int, setter_tree)).unwrap();
    assert_eq!(setter.invoke(&[]).unwrap().to_int(), Some(7));
    assert_eq!(reader_cell.get().to_int(), Some(7));
}

#[test]
fn quoting_then_compiling_matches_direct_compilation() {
    // λ(). quote (λy. y * 3) compiled from the reified tree behaves like
    // compiling the lambda directly.
    let y = Var::new("y", Type::Int);
    let inner = Expr::lambda(
        None,
        vec![y.clone()],
        Type::Int,
        Expr::binary(arbor::BinaryOp::Mul, Expr::variable(&y), Expr::int(3)),
    );
    let direct = compile(&inner).unwrap();

    let quoter = Expr::lambda(None, vec![], Type::Tree, Expr::quote(inner.clone()));
    let reified = compile(&quoter).unwrap().invoke(&[]).unwrap();
    let via_quote = compile(reified.as_tree().unwrap()).unwrap();

    for n in [-2_i64, 0, 5] {
        assert_eq!(
            direct.invoke(&[Value::Int(n)]).unwrap(),
            via_quote.invoke(&[Value::Int(n)]).unwrap()
        );
    }
}

#[test]
fn quoted_variable_forces_boxing_but_not_a_record() {
    let x = Var::new("x", Type::Int);
    let body = Expr::block(
        vec![],
        vec![Expr::quote(Expr::variable(&x)), Expr::variable(&x)],
    );
    let lam = Expr::lambda(None, vec![x.clone()], Type::Int, body);
    let f = compile(&lam).unwrap();
    // boxed in a cell the quote can alias
    assert!(f.disassemble().contains("newcell"));
    assert_eq!(f.invoke(&[Value::Int(5)]).unwrap().to_int(), Some(5));
}
