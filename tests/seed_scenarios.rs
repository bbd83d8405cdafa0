//! The six literal end-to-end scenarios covering the interpretation
//! invariants this crate exists to get right: internal/external queue
//! priority, event-descriptor matching, `<foreach>` shallow-copy semantics,
//! `<cancel>` of a delayed `<send>`, `<invoke>`/`done.invoke` correlation,
//! and history restoration.

mod support;

use scxml_core::data_model::Data;
use scxml_core::event::Event;
use support::run_to_completion;

/// Onentry raises an external self-send and an internal one; the internal
/// queue must always drain before anything external is looked at, so
/// `event1` (internal) is processed before `event2` (external) even though
/// `event2` was sent first.
#[test]
fn queue_priority_favors_internal_over_external() {
    let xml = r#"
        <scxml initial="s0">
          <state id="s0">
            <onentry>
              <send event="event2"/>
              <send target="#_internal" event="event1"/>
            </onentry>
            <transition event="event1" target="pass"/>
            <transition event="event2" target="fail"/>
          </state>
          <final id="pass"/>
          <final id="fail"/>
        </scxml>
    "#;
    let outcome = run_to_completion(xml, vec![]);
    assert!(outcome.reached("pass"), "reached: {:?}", outcome.reached_final);
    assert!(!outcome.reached("fail"));
}

/// `foo` matches `foo.bar` at a dot boundary and is listed before the `*`
/// catch-all in document order, so it must win even though both descriptors
/// match the incoming event.
#[test]
fn event_descriptor_matching_prefers_specific_over_wildcard() {
    let xml = r#"
        <scxml initial="s0">
          <state id="s0">
            <transition event="foo" target="s1"/>
            <transition event="*" target="fail"/>
          </state>
          <state id="s1">
            <transition target="pass"/>
          </state>
          <final id="pass"/>
          <final id="fail"/>
        </scxml>
    "#;
    let outcome = run_to_completion(xml, vec![Event::external("foo.bar")]);
    assert!(outcome.reached("pass"), "reached: {:?}", outcome.reached_final);
    assert!(!outcome.reached("fail"));
}

/// `<foreach>` snapshots `Var1` once before the first iteration; three
/// iterations over `[1,2,3]` must leave `Var2` at exactly 3 regardless of
/// what the loop body does to the array.
#[test]
fn foreach_iterates_a_snapshot_taken_before_the_loop_starts() {
    let xml = r#"
        <scxml datamodel="ecmascript" initial="s0">
          <datamodel>
            <data id="Var1" expr="[1,2,3]"/>
            <data id="Var2" expr="0"/>
          </datamodel>
          <state id="s0">
            <onentry>
              <foreach array="Var1" item="x">
                <assign location="Var2" expr="Var2+1"/>
              </foreach>
            </onentry>
            <transition target="done"/>
          </state>
          <final id="done"/>
        </scxml>
    "#;
    let outcome = run_to_completion(xml, vec![]);
    assert!(outcome.reached("done"));
    match outcome.var("Var2") {
        Some(Data::Double(n)) => assert_eq!(n, 3.0),
        other => panic!("expected Var2 == 3, got {:?}", other),
    }
}

/// `<cancel>` removes the 1s-delayed `boom` before it ever fires; the
/// 100ms-delayed `ok` still arrives and drives the transition to `pass`.
/// `boom`'s transition must never be taken.
#[test]
fn cancel_prevents_a_pending_delayed_send_from_firing() {
    let xml = r#"
        <scxml initial="s0">
          <state id="s0">
            <onentry>
              <send event="boom" delay="1s" id="k"/>
              <cancel sendid="k"/>
              <send event="ok" delay="100ms"/>
            </onentry>
            <transition event="boom" target="fail"/>
            <transition event="ok" target="pass"/>
          </state>
          <final id="pass"/>
          <final id="fail"/>
        </scxml>
    "#;
    let outcome = run_to_completion(xml, vec![]);
    assert!(outcome.reached("pass"), "reached: {:?}", outcome.reached_final);
    assert!(!outcome.reached("fail"), "boom was delivered despite being cancelled");
}

/// The parent invokes an inline child that enters `<final>` immediately with
/// `donedata` 42; the parent only takes the `pass` transition once
/// `done.invoke.<id>` carries that value.
#[test]
fn invoke_done_event_carries_the_childs_donedata() {
    let xml = r#"
        <scxml datamodel="ecmascript" initial="s0">
          <state id="s0">
            <invoke>
              <content>
                <scxml datamodel="ecmascript" initial="done">
                  <final id="done">
                    <donedata>
                      <content expr="42"/>
                    </donedata>
                  </final>
                </scxml>
              </content>
            </invoke>
            <transition event="done.invoke.*" cond="_event.data == 42" target="pass"/>
            <transition event="done.invoke.*" target="fail"/>
          </state>
          <final id="pass"/>
          <final id="fail"/>
        </scxml>
    "#;
    let outcome = run_to_completion(xml, vec![]);
    assert!(outcome.reached("pass"), "reached: {:?}", outcome.reached_final);
    assert!(!outcome.reached("fail"));
}

/// `s`'s default child is `s2`; the run moves to `s1` before leaving `s`
/// entirely, so the deep history at `h` must restore `s1` on the way back in
/// rather than falling through to the default.
#[test]
fn deep_history_restores_last_active_child_not_the_default() {
    let xml = r#"
        <scxml initial="s">
          <state id="s">
            <initial>
              <transition target="s2"/>
            </initial>
            <history id="h" type="deep"/>
            <state id="s1">
              <transition event="leave" target="outside"/>
              <transition event="check" target="pass"/>
            </state>
            <state id="s2">
              <transition event="go1" target="s1"/>
              <transition event="leave" target="outside"/>
              <transition event="check" target="fail"/>
            </state>
          </state>
          <state id="outside">
            <transition event="back" target="h"/>
          </state>
          <final id="pass"/>
          <final id="fail"/>
        </scxml>
    "#;
    let outcome = run_to_completion(
        xml,
        vec![
            Event::external("go1"),
            Event::external("leave"),
            Event::external("back"),
            Event::external("check"),
        ],
    );
    assert!(outcome.reached("pass"), "reached: {:?}", outcome.reached_final);
    assert!(!outcome.reached("fail"), "history fell back to the default child s2");
}
