// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use wasir::{
        compile_module, CompileOptions, Features, Label, LabelKind, Module, Operation,
    };
    use wast::{parser, QuoteWat, Wast, WastDirective, Wat};

    /// A small script in the upstream-testsuite shape: every module
    /// directive is encoded, loaded and compiled, and the structural
    /// invariants are checked across the whole batch.
    const SCRIPT: &str = r#"
        (module
          (func (export "fib") (param i32) (result i32)
            (local i32 i32 i32)
            i32.const 0
            local.set 1
            i32.const 1
            local.set 2
            block
              loop
                local.get 0
                i32.eqz
                br_if 1
                local.get 1
                local.get 2
                i32.add
                local.set 3
                local.get 2
                local.set 1
                local.get 3
                local.set 2
                local.get 0
                i32.const 1
                i32.sub
                local.set 0
                br 0
              end
            end
            local.get 1))

        (module
          (memory 1)
          (global $sum (mut i64) (i64.const 0))
          (func (param i32 i32) (result i64)
            local.get 0
            i64.load
            local.get 1
            i64.load offset=8
            i64.add
            global.get $sum
            i64.add
            global.set $sum
            global.get $sum))

        (assert_return (invoke "fib" (i32.const 10)) (i32.const 55))

        (module
          (func (param i32) (result f64)
            local.get 0
            if (result f64)
              local.get 0
              f64.convert_i32_s
            else
              f64.const -1
            end
            f64.sqrt))

        (module
          (memory 1)
          (func (param i32 v128) (result v128)
            local.get 0
            v128.load
            local.get 1
            i32x4.add
            local.get 0
            i32.const 16
            i32.add
            v128.load
            i32x4.max_s))
    "#;

    fn check_invariants(operations: &[Operation], label_callers: &HashMap<Label, u32>) {
        let mut counted: HashMap<Label, u32> = HashMap::new();
        let mut bump = |label: Label| {
            if label.kind() != LabelKind::Return {
                *counted.entry(label).or_insert(0) += 1;
            }
        };
        for op in operations {
            match op {
                Operation::Br(label) => bump(*label),
                Operation::BrIf {
                    then_target,
                    else_target,
                } => {
                    bump(then_target.label);
                    bump(else_target.label);
                }
                Operation::BrTable { targets, default } => {
                    for target in targets.iter().chain(std::iter::once(default)) {
                        bump(target.label);
                    }
                }
                Operation::Drop(range) => {
                    assert!(range.end >= range.start && range.start >= 0);
                }
                _ => {}
            }
        }
        assert_eq!(&counted, label_callers);
        assert_eq!(operations.last(), Some(&Operation::Br(Label::ret())));

        // Every emitted label is unique.
        let mut seen = HashMap::new();
        for op in operations {
            if let Operation::Label(label) = op {
                *seen.entry(*label).or_insert(0u32) += 1;
            }
        }
        assert!(seen.values().all(|count| *count == 1));
    }

    #[test]
    fn compile_every_module_in_the_script() {
        let pb = parser::ParseBuffer::new(SCRIPT).unwrap();
        let ast = parser::parse::<Wast>(&pb).unwrap();

        let mut modules = vec![];
        for directive in ast.directives {
            if let WastDirective::Module(mut module) = directive {
                let is_module = matches!(
                    &module,
                    QuoteWat::Wat(Wat::Module(_)) | QuoteWat::QuoteModule(..)
                );
                if is_module {
                    modules.push(module.encode().unwrap());
                }
            }
        }
        assert_eq!(modules.len(), 4);

        for binary in modules {
            let module = Module::load(&binary, Features::default()).unwrap();
            let results = compile_module(&module, &CompileOptions::default()).unwrap();
            assert_eq!(results.len(), module.code.len());
            for result in &results {
                check_invariants(&result.operations, &result.label_callers);
            }
        }
    }

    #[test]
    fn termination_checking_only_adds_poll_points() {
        let pb = parser::ParseBuffer::new(SCRIPT).unwrap();
        let ast = parser::parse::<Wast>(&pb).unwrap();
        for directive in ast.directives {
            if let WastDirective::Module(mut module) = directive {
                let Ok(binary) = module.encode() else {
                    continue;
                };
                let module = Module::load(&binary, Features::default()).unwrap();
                let plain = compile_module(&module, &CompileOptions::default()).unwrap();
                let instrumented = compile_module(
                    &module,
                    &CompileOptions {
                        ensure_termination: true,
                        ..CompileOptions::default()
                    },
                )
                .unwrap();
                for (p, i) in plain.iter().zip(&instrumented) {
                    let stripped: Vec<_> = i
                        .operations
                        .iter()
                        .filter(|op| **op != Operation::BuiltinFunctionCheckExitCode)
                        .cloned()
                        .collect();
                    assert_eq!(stripped, p.operations);
                    assert_eq!(i.label_callers, p.label_callers);
                }
            }
        }
    }
}
