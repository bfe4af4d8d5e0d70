use kube::CustomResourceExt;
use mywebapp_operator_apis::MyWebApp;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&MyWebApp::crd()).unwrap());
}
