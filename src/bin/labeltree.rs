extern crate clap;
extern crate labeltree;

use clap::value_t;
use labeltree::config::Config;
use labeltree::data::{DataReader, DataSet};
use labeltree::model::eval;
use labeltree::model::train::PltTrainer;
use labeltree::Model;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

fn parse_train_config(matches: &clap::ArgMatches) -> Config {
    let mut config = Config::default();

    config.threads = value_t!(matches, "threads", usize).unwrap();
    config.arity = value_t!(matches, "arity", usize).unwrap();
    config.tree_file = matches.value_of("tree").map(str::to_owned);
    config.tree_kind = matches.value_of("treeType").unwrap().parse().unwrap();
    config.optimizer = matches.value_of("optimizer").unwrap().parse().unwrap();
    config.loss = matches.value_of("loss").unwrap().parse().unwrap();
    config.epochs = value_t!(matches, "epochs", u32).unwrap();
    config.eta = value_t!(matches, "eta", f64).unwrap();
    config.weights_threshold = value_t!(matches, "weightsThreshold", f64).unwrap();
    config.top_k = value_t!(matches, "topK", usize).unwrap();
    config.tmax = value_t!(matches, "tmax", i64).unwrap();
    config.cost = value_t!(matches, "cost", f64).unwrap();
    config.eps = value_t!(matches, "eps", f64).unwrap();
    config.max_iter = value_t!(matches, "maxIter", u32).unwrap();
    config.inbalance_labels_weighting = matches.is_present("inbalanceLabelsWeighting");
    config.auto_c_lin = matches.is_present("autoCLin");
    config.auto_c_log = matches.is_present("autoCLog");
    config.load_as = matches.value_of("loadAs").unwrap().parse().unwrap();
    if matches.is_present("seed") {
        config.seed = Some(value_t!(matches, "seed", u64).unwrap());
    }

    config.validate().unwrap();
    config
}

fn train(matches: &clap::ArgMatches) {
    let config = parse_train_config(matches);
    let model_dir = Path::new(matches.value_of("output").unwrap());
    fs::create_dir_all(model_dir).expect("Failed to create model directory");

    let dataset = DataSet::load_xc_repo_data_file(matches.value_of("input").unwrap())
        .expect("Failed to load training data");

    config
        .save(model_dir.join("args.bin"))
        .expect("Failed to save configuration");
    DataReader::from_dataset(&dataset)
        .save(model_dir.join("data_reader.bin"))
        .expect("Failed to save data reader");

    PltTrainer::new(config)
        .train(&dataset, model_dir)
        .expect("Failed to train model");
}

fn load_for_inference(matches: &clap::ArgMatches) -> (Config, DataSet, Model) {
    let model_dir = Path::new(matches.value_of("output").unwrap());

    let mut config = Config::load(model_dir.join("args.bin")).expect("Failed to load args.bin");
    config.threads = value_t!(matches, "threads", usize).unwrap();
    config.top_k = value_t!(matches, "topK", usize).unwrap();

    let reader =
        DataReader::load(model_dir.join("data_reader.bin")).expect("Failed to load data reader");
    let mut dataset = DataSet::load_xc_repo_data_file(matches.value_of("input").unwrap())
        .expect("Failed to load input data");
    dataset.align_to(&reader);

    let model = Model::load(model_dir, &config).expect("Failed to load model");
    (config, dataset, model)
}

fn test(matches: &clap::ArgMatches) {
    let (config, dataset, model) = load_for_inference(matches);
    eval::test_all(&model, &dataset, &config).expect("Failed to test model");
}

fn predict(matches: &clap::ArgMatches) {
    let (config, dataset, model) = load_for_inference(matches);
    let predictions =
        eval::predict_all(&model, &dataset, &config).expect("Failed to predict");

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (truth, prediction) in dataset.label_lists.iter().zip(&predictions) {
        let first_true = truth.first().map_or(-1, |&l| l as i64);
        write!(&mut out, "{}", first_true).unwrap();
        for &(label, prob) in prediction {
            write!(&mut out, " {}:{:.5}", label, prob).unwrap();
        }
        writeln!(&mut out).unwrap();
    }
}

fn main() {
    simple_logger::SimpleLogger::new().init().unwrap();

    let default_config = Config::default();
    let default_threads = default_config.threads.to_string();
    let default_arity = default_config.arity.to_string();
    let default_epochs = default_config.epochs.to_string();
    let default_eta = default_config.eta.to_string();
    let default_weights_threshold = default_config.weights_threshold.to_string();
    let default_top_k = default_config.top_k.to_string();
    let default_tmax = default_config.tmax.to_string();
    let default_cost = default_config.cost.to_string();
    let default_eps = default_config.eps.to_string();
    let default_max_iter = default_config.max_iter.to_string();

    let input_arg = || {
        clap::Arg::with_name("input")
            .long("input")
            .help("Path to the input data file")
            .takes_value(true)
            .value_name("PATH")
            .required(true)
    };
    let output_arg = || {
        clap::Arg::with_name("output")
            .long("output")
            .help("Path of the model directory")
            .takes_value(true)
            .value_name("DIR")
            .required(true)
    };
    let threads_arg = || {
        clap::Arg::with_name("threads")
            .long("threads")
            .help("Number of worker threads")
            .takes_value(true)
            .value_name("T")
            .default_value(&default_threads)
    };
    let top_k_arg = || {
        clap::Arg::with_name("topK")
            .long("topK")
            .help("Number of top predictions per example")
            .takes_value(true)
            .value_name("K")
            .default_value(&default_top_k)
    };

    let arg_matches = clap::App::new("labeltree")
        .about("labeltree: Probabilistic Label Trees for extreme multi-label classification")
        .subcommand(
            clap::SubCommand::with_name("train")
                .about("Train a new model")
                .arg(input_arg())
                .arg(output_arg())
                .arg(threads_arg())
                .arg(top_k_arg())
                .arg(
                    clap::Arg::with_name("arity")
                        .long("arity")
                        .help("Maximum number of children per tree node")
                        .takes_value(true)
                        .value_name("A")
                        .default_value(&default_arity),
                )
                .arg(
                    clap::Arg::with_name("tree")
                        .long("tree")
                        .help("Path to a tree structure file; overrides --treeType")
                        .takes_value(true)
                        .value_name("PATH"),
                )
                .arg(
                    clap::Arg::with_name("treeType")
                        .long("treeType")
                        .help("How the tree is built")
                        .takes_value(true)
                        .value_name("TYPE")
                        .default_value("completeInOrder")
                        .possible_values(&["completeInOrder", "completeRandom"]),
                )
                .arg(
                    clap::Arg::with_name("optimizer")
                        .long("optimizer")
                        .help("Optimizer used for node classifiers")
                        .takes_value(true)
                        .value_name("OPT")
                        .default_value("liblinear")
                        .possible_values(&["liblinear", "sgd", "adagrad"]),
                )
                .arg(
                    clap::Arg::with_name("loss")
                        .long("loss")
                        .help("Loss function for node classifiers")
                        .takes_value(true)
                        .value_name("LOSS")
                        .default_value("logistic")
                        .possible_values(&["logistic", "squaredHinge", "pwLogistic"]),
                )
                .arg(
                    clap::Arg::with_name("epochs")
                        .long("epochs")
                        .help("Number of passes over each node's supervision (online optimizers)")
                        .takes_value(true)
                        .value_name("E")
                        .default_value(&default_epochs),
                )
                .arg(
                    clap::Arg::with_name("eta")
                        .long("eta")
                        .help("Learning rate for online optimizers")
                        .takes_value(true)
                        .value_name("ETA")
                        .default_value(&default_eta),
                )
                .arg(
                    clap::Arg::with_name("weightsThreshold")
                        .long("weightsThreshold")
                        .help("Threshold for pruning node weight vectors")
                        .takes_value(true)
                        .value_name("THRESHOLD")
                        .default_value(&default_weights_threshold),
                )
                .arg(
                    clap::Arg::with_name("tmax")
                        .long("tmax")
                        .help("Online update budget per node; -1 for unlimited")
                        .takes_value(true)
                        .value_name("T")
                        .allow_hyphen_values(true)
                        .default_value(&default_tmax),
                )
                .arg(
                    clap::Arg::with_name("cost")
                        .long("cost")
                        .help("Cost co-efficient for the dual solvers")
                        .takes_value(true)
                        .value_name("C")
                        .default_value(&default_cost),
                )
                .arg(
                    clap::Arg::with_name("eps")
                        .long("eps")
                        .help("Epsilon for determining solver convergence")
                        .takes_value(true)
                        .value_name("EPS")
                        .default_value(&default_eps),
                )
                .arg(
                    clap::Arg::with_name("maxIter")
                        .long("maxIter")
                        .help("Max number of iterations for the dual solvers")
                        .takes_value(true)
                        .value_name("M")
                        .default_value(&default_max_iter),
                )
                .arg(
                    clap::Arg::with_name("inbalanceLabelsWeighting")
                        .long("inbalanceLabelsWeighting")
                        .help("Weight classes by their inverse frequency on unbalanced nodes"),
                )
                .arg(
                    clap::Arg::with_name("autoCLin")
                        .long("autoCLin")
                        .help("Scale cost by the node's share of the dataset"),
                )
                .arg(
                    clap::Arg::with_name("autoCLog")
                        .long("autoCLog")
                        .help("Scale cost by one plus the log of the node's share of the dataset"),
                )
                .arg(
                    clap::Arg::with_name("loadAs")
                        .long("loadAs")
                        .help("Weight vector layout used when the model is loaded")
                        .takes_value(true)
                        .value_name("REPR")
                        .default_value("map")
                        .possible_values(&["dense", "sparse", "map"]),
                )
                .arg(
                    clap::Arg::with_name("seed")
                        .long("seed")
                        .help("Seed for random leaf assignment")
                        .takes_value(true)
                        .value_name("SEED"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("test")
                .about("Test an existing model")
                .arg(input_arg())
                .arg(output_arg())
                .arg(threads_arg())
                .arg(top_k_arg()),
        )
        .subcommand(
            clap::SubCommand::with_name("predict")
                .about("Print top-K predictions for every input row")
                .arg(input_arg())
                .arg(output_arg())
                .arg(threads_arg())
                .arg(top_k_arg()),
        )
        .get_matches();

    if let Some(arg_matches) = arg_matches.subcommand_matches("train") {
        train(arg_matches);
    } else if let Some(arg_matches) = arg_matches.subcommand_matches("test") {
        test(arg_matches);
    } else if let Some(arg_matches) = arg_matches.subcommand_matches("predict") {
        predict(arg_matches);
    } else {
        println!("{}", arg_matches.usage());
    }
}
